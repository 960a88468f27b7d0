pub mod cache;
pub mod digest;
pub mod geo;
pub mod location;
pub mod message;
pub mod month;

pub use cache::{AllowDeny, CacheEntry, CacheKey, CacheState, CertVerdict, RulesetCert};
pub use geo::{Point, Rectangle};
pub use location::LocationData;
pub use message::{AlsDataType, AlsEnvelope, AlsMessage, AlsParseError, AlsPayload};
