use anyhow::{Result, anyhow};
use std::collections::HashSet;

const MAX_FILENAME_BYTES: usize = 255;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Validates file size against maximum limit
pub fn validate_file_size(size: u64, max_size: u64) -> Result<()> {
    if size > max_size {
        return Err(anyhow!(ValidationError {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        }));
    }
    Ok(())
}

/// Sanitize an uploaded filename for storage in metadata and archives.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    // Only the last path component survives, whichever separator was used
    let name = filename.rsplit(['/', '\\']).next().unwrap_or("").trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(anyhow!(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        }));
    }

    if name.len() != filename.trim().len() {
        tracing::warn!("Path components stripped from filename: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > MAX_FILENAME_BYTES {
        let mut end = MAX_FILENAME_BYTES;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    // Prevent hidden files
    if sanitized.starts_with('.') {
        return Err(anyhow!(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        }));
    }

    Ok(sanitized)
}

/// Hands out archive entry names, suffixing repeats as `name (2).ext`.
#[derive(Debug, Default)]
pub struct EntryNamer {
    used: HashSet<String>,
}

impl EntryNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_name(&mut self, original_name: &str, fallback: &str) -> String {
        let base = sanitize_filename(original_name).unwrap_or_else(|_| fallback.to_string());

        if self.used.insert(base.to_lowercase()) {
            return base;
        }

        let (stem, ext) = match base.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (base.clone(), None),
        };

        let mut counter = 2;
        loop {
            let candidate = match &ext {
                Some(ext) => format!("{} ({}).{}", stem, counter, ext),
                None => format!("{} ({})", stem, counter),
            };
            if self.used.insert(candidate.to_lowercase()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_size() {
        assert!(validate_file_size(100, 1000).is_ok());
        assert!(validate_file_size(1000, 1000).is_ok());
        assert!(validate_file_size(1001, 1000).is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("IMG_0001.JPG").unwrap(), "IMG_0001.JPG");
        assert_eq!(sanitize_filename("my shoot.cr3").unwrap(), "my shoot.cr3");
        assert_eq!(
            sanitize_filename("test<script>.jpg").unwrap(),
            "test_script_.jpg"
        );
        assert_eq!(sanitize_filename("婚礼.jpg").unwrap(), "婚礼.jpg");

        // Path traversal
        assert_eq!(sanitize_filename("../../../etc/passwd").unwrap(), "passwd");
        assert_eq!(
            sanitize_filename("..\\..\\windows\\system32").unwrap(),
            "system32"
        );

        // Empty and hidden files
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("photos/").is_err());
        assert!(sanitize_filename(".htaccess").is_err());
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(200);
        let sanitized = sanitize_filename(&long).unwrap();
        assert!(sanitized.len() <= 255);
        assert!(sanitized.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_entry_namer_deduplicates() {
        let mut namer = EntryNamer::new();
        assert_eq!(namer.next_name("a.jpg", "f1"), "a.jpg");
        assert_eq!(namer.next_name("a.jpg", "f2"), "a (2).jpg");
        assert_eq!(namer.next_name("A.JPG", "f3"), "A (3).JPG");
        assert_eq!(namer.next_name("README", "f4"), "README");
        assert_eq!(namer.next_name("README", "f5"), "README (2)");
        assert_eq!(namer.next_name("../", "unnamed_6"), "unnamed_6");
    }
}
