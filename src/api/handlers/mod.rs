pub mod archives;
pub mod files;
pub mod health;
