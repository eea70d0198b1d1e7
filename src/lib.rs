//! Board Link - controller-side connection to an embedded board.
//!
//! Keeps one length-prefixed JSON connection to a board alive across board
//! reboots and cable pulls, and exchanges plain messages with it: settings
//! updates going out, status and telemetry coming back.
//!
//! # Modules
//!
//! - [`link`] - Peer link: framing codec, reconnect state machine, loops
//! - [`board`] - Simulated board speaking the peer side of the protocol
//! - [`config`] - Configuration loading/saving
//! - [`constants`] - Wire limits and default timings
//!
//! # Example
//!
//! ```no_run
//! use board_link::{PeerEndpoint, PeerLink};
//!
//! # async fn run() -> Result<(), board_link::LinkError> {
//! let link = PeerLink::with_handler(PeerEndpoint::new("192.168.1.50", 5000), |message| {
//!     println!("board says {message:?}");
//! });
//! link.connect().await;
//!
//! let mut settings = serde_json::Map::new();
//! settings.insert("pwm01".into(), 128.into());
//! link.update_settings(settings).await?;
//!
//! link.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod board;
pub mod config;
pub mod constants;
pub mod link;

// Re-export commonly used types
pub use board::SimulatedBoard;
pub use config::LinkConfig;
pub use link::{LinkError, LinkState, Message, PeerEndpoint, PeerLink};
