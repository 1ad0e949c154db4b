// Module naming follows project convention: `Core` holds memory and scheduling
// plumbing, `Dispatcher` the partitioned log and its publish/subscribe API.
#[allow(non_snake_case)]
pub mod Core {
    pub mod agent;
    pub mod alloc;
    pub mod futex;
    pub mod view;
    pub mod Storage;
    pub use Storage::{HeapStorage, MappedFileStorage, StorageBackend};
}

#[allow(non_snake_case)]
pub mod Dispatcher {
    pub mod Buffer {
        pub mod appender;
        pub mod frame;
        pub mod log_buffer;
        pub mod partition;
        pub mod position;
        pub use log_buffer::LogBuffer; // re-export for stable path
        pub use position::AtomicPosition;
    }
    pub mod block_peek;
    pub mod builder;
    pub mod claim;
    mod conductor;
    pub mod dispatcher;
    pub mod handler;
    pub mod subscription;

    pub use block_peek::{BlockFragments, BlockPeek};
    pub use builder::DispatcherBuilder;
    pub use claim::{ClaimedFragment, ClaimedFragmentBatch};
    pub use dispatcher::{Admission, Dispatcher};
    pub use handler::{Fragment, FragmentHandler, FragmentOutcome};
    pub use subscription::{Subscription, SubscriptionState, SubscriptionStatus};
}

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;

pub use config::{DispatchMode, DispatcherConfig, IdleConfig};
pub use error::DispatcherError;
