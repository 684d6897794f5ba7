//! Transport layer - bus abstraction, chunked transfers and test doubles.

pub mod buffer;
pub mod chunked;
pub mod mock;
pub mod observable;
pub mod sim;
pub mod traits;

pub use buffer::TransportBuffer;
pub use chunked::{BusSession, ChunkedTransport};
pub use mock::MockBus;
pub use observable::ObservableBus;
pub use sim::SimulatedController;
pub use traits::{BusType, HardwareControl, TcmBus, TransportError};
