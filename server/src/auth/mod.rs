pub mod handshake;
pub mod password;
pub mod ticket;
