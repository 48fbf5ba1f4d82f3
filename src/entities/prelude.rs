pub use super::archives::Entity as Archives;
pub use super::file_chunks::Entity as FileChunks;
pub use super::stored_files::Entity as StoredFiles;
