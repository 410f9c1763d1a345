//! Self-forming register mesh for short-range packet radios.
//!
//! Nodes pick their own addresses, flood each other's traffic, and expose
//! named byte-string registers that any node can read or write from
//! anywhere on the mesh. Everything rides on fixed 64-byte frames over a
//! half-duplex, collision-prone link with no acknowledgments; reliability
//! comes from small repeat caches and requester retries instead.
//!
//! ## Highlights
//!
//! - Self-assigned node ids (1-255) with a per-boot random unique id as
//!   the only tiebreaker; contested claims step to the next id
//! - Flood propagation with a hop ceiling, no routing tables
//! - Named-register RPC: count, enumerate, read, write, broadcast
//! - Single-threaded polled engine; bring any [`Radio`] implementation
//!
//! ## Example
//!
//! ```no_run
//! use regmesh_core::{Completion, MeshConfig, Node, RadioConfig, Register, SharedAir};
//!
//! fn main() -> Result<(), regmesh_core::MeshError> {
//!     let air = SharedAir::new();
//!
//!     let mut server = Node::new(air.attach(), MeshConfig::default());
//!     server.initialize(&RadioConfig::default())?;
//!     server.add_register(Register::with_value("temp", b"21.5")?)?;
//!     server.join_blocking(1)?;
//!
//!     let mut client = Node::new(air.attach(), MeshConfig::default());
//!     client.initialize(&RadioConfig::default())?;
//!     client.join_blocking(2)?;
//!
//!     client.get_register(
//!         Register::named("temp")?,
//!         Completion::callback(|node, status| {
//!             println!("{:?}: {:?}", status, node.op_register().value_str());
//!         }),
//!     )?;
//!
//!     // nodes advance only when polled
//!     loop {
//!         server.update()?;
//!         client.update()?;
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod node;
pub mod packet;
pub mod presence;
pub mod radio;
pub mod register;
pub mod repeat;
pub mod sim;

pub use config::MeshConfig;
pub use error::MeshError;
pub use node::{BroadcastHandler, Completion, Node, NumRegistersResult, State, Status};
pub use packet::{Packet, PacketType, PACKET_SIZE};
pub use presence::PresenceTable;
pub use radio::{DataRate, Radio, RadioConfig, RadioError, RxStatus};
pub use register::{Register, SetOutcome, MAX_REGISTER_DATA};
pub use sim::{AirStats, SharedAir, SimRadio};

/// Common imports for applications built on the mesh.
pub mod prelude {
    pub use crate::config::MeshConfig;
    pub use crate::error::MeshError;
    pub use crate::node::{Completion, Node, NumRegistersResult, State, Status};
    pub use crate::radio::{DataRate, Radio, RadioConfig, RadioError, RxStatus};
    pub use crate::register::{Register, SetOutcome};
    pub use crate::sim::{SharedAir, SimRadio};
}
