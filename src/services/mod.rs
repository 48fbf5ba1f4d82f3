pub mod archive_service;
pub mod archive_worker;
pub mod chunk_store;
pub mod download;
pub mod events;
pub mod file_service;
pub mod paths;
pub mod storage;
pub mod worker;
