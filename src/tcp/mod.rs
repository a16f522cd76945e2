pub mod frame_reassembler;
pub mod tcp_connection;
pub mod tcp_endpoint;
mod tcp_receiver;
