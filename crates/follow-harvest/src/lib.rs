//! Follow Harvest: enumerate a render-virtualized following list, reconcile
//! DOM and network records into one canonical record per member, and run
//! rate-limited unfollow batches.

pub mod config;
pub mod correlator;
pub mod crawl;
pub mod error;
pub mod events;
pub mod executor;
pub mod harvester;
pub mod merge;
pub mod roster;
pub mod session;
pub mod store;
pub mod surface;
pub mod types;

pub use config::{CrawlConfig, ExecutorConfig, HarvestConfig};
pub use correlator::{decode_ordering_token, PayloadCorrelator};
pub use crawl::{CrawlDriver, CrawlOutcome, ExitReason};
pub use error::{HarvestError, HarvestResult};
pub use events::{EventBus, HarvestEvent};
pub use executor::{BatchExecutor, BatchReport, SkipReason};
pub use harvester::{DomHarvester, ScanReport};
pub use merge::merge_records;
pub use roster::{Roster, RosterFilter, RosterSort};
pub use session::{is_following_view, BatchOutcome, FollowingHarvester, PayloadSink};
pub use store::{HarvestStores, MetadataStore, PresenceStore, VisitedSet};
pub use surface::virtual_list::{SimMember, VirtualListConfig, VirtualListSurface};
pub use surface::{ControlQuery, Fragment, RenderSurface, ScrollMetrics};
pub use types::*;
