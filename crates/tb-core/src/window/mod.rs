mod key;
mod router;
mod state;
mod store;
mod watermark;

pub use key::{TumblingAssigner, WindowKey};
pub use router::{KeyRouter, mix64};
pub use state::{OffsetSpan, WindowState};
pub use store::{FoldOutcome, Phase, WindowStore};
pub use watermark::WatermarkTracker;
