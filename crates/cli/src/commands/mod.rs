pub mod ask;
pub mod init;
pub mod routes;
pub mod status;
pub mod tools_cmd;
