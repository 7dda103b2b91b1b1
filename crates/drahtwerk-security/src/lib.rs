// SPDX-License-Identifier: MIT
//
// Drahtwerk — TLS provisioning: self-signed certificate generation and
// rustls acceptor construction for the WebSocket transport.

pub mod certificates;
pub mod tls;

pub use certificates::generate_self_signed;
pub use tls::server_acceptor;
