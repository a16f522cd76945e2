pub mod ack_packet;
pub mod client_handshake;
pub mod connection_packets;
pub mod data_packet;
pub mod ncp_client;
pub mod ncp_server;
pub mod ncp_session;
pub mod packet_header;
pub mod proof_of_work;
pub mod reliability;
pub mod send_socket;
pub mod sequence_number;
pub mod server_handshake;
