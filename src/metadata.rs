pub mod bencode;
pub mod field;
pub mod file;
pub mod tracker;
