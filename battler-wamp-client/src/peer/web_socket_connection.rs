use anyhow::Result;

use crate::{
    peer::connection::{
        Connection,
        ConnectionConfig,
    },
    transport::web_socket_transport::WebSocketTransportFactory,
};

/// Creates a new [`Connection`] that connects to the router over a WebSocket.
pub fn new_web_socket_connection(config: ConnectionConfig) -> Result<Connection> {
    Connection::new(config, Box::new(WebSocketTransportFactory::default()))
}
