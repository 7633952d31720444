//! Outbound distribution to push consumers.

mod distributor;
mod filter;
mod split;
mod target;
mod transport;

pub use distributor::{DeliveryReport, DistributorStats, OutboundDistributor};
pub use filter::ContentFilter;
pub use split::split;
pub use target::{ChannelPolicy, OutboundTarget};
pub use transport::{ChannelProvider, DeliveryChannel, DeliveryContext, JsonCodec, PayloadCodec, MAX_CHUNK_BYTES};
