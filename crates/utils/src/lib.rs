pub mod assets;
pub mod msg_store;
pub mod response;
pub mod status_msg;
