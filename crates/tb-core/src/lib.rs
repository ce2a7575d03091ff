pub mod commit;
pub mod error;
pub mod event;
pub mod finalize;
pub mod sink;
pub mod source;
pub mod window;
pub mod worker;
