// SPDX-License-Identifier: MIT
//
// Hardware service adapters. Each adapter attaches its channels to the
// shared transport and runs its own background tasks; the supervisor only
// ever starts a boxed set of them and drops the whole set at teardown.

pub mod api;
pub mod cloud_proxy;
pub mod printer;
pub mod serial;

use async_trait::async_trait;

use drahtwerk_core::error::Result;

pub use api::ApiServer;
pub use cloud_proxy::CloudProxyService;
pub use printer::{LpSpooler, PrintSpooler, PrinterService};
pub use serial::{DevicePathLink, SerialLink, SerialService};

/// A long-lived adapter owned by one supervisor generation.
///
/// `start` attaches channels and spawns whatever background work the
/// adapter needs; dropping the adapter must tear that work down again.
#[async_trait]
pub trait BridgeService: Send {
    fn name(&self) -> &str;

    async fn start(&mut self) -> Result<()>;
}
