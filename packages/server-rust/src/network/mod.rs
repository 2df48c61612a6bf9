//! Listeners, port reservations, sessions, and the network stack that binds
//! services to transports.

pub mod access_log;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod reservation;
pub mod session;
pub mod shutdown;
pub mod stack;

pub use config::*;
pub use connection::*;
pub use reservation::{Claim, PortReservation, ReservationTable};
pub use session::{SessionId, SessionStore};
pub use shutdown::*;
pub use stack::{BoundListener, ListenerOutcome, NetworkError, NetworkStack, ServiceRegistration};
