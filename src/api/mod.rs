pub mod upstox;

pub use upstox::{parse_order_state, UpstoxCatalog, UpstoxClient};
