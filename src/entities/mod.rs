pub mod prelude;

pub mod archives;
pub mod file_chunks;
pub mod stored_files;
