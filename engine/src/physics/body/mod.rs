//! Body storage, locking and the public body API

pub mod activation;
#[allow(clippy::module_inception)]
pub mod body;
pub mod create_info;
pub mod id;
pub mod interface;
pub mod lock;
pub mod lock_interface;
pub mod manager;
pub mod motion;
pub mod mutex_array;

pub use activation::{ActivationPermit, BodyActivationListener};
pub use body::{Body, BodyFlags};
pub use create_info::{BodyCreateInfo, MassPropertiesOverride};
pub use id::BodyId;
pub use interface::{Activation, BodyInterface};
pub use lock::{BodyLockMultiRead, BodyLockMultiWrite, BodyLockRead, BodyLockWrite};
pub use lock_interface::{BodyLockInterface, BodyLockInterfaceLocking, BodyLockInterfaceNoLock};
pub use manager::{AllBodiesLock, BodyError, BodyManager, BodyStats, SlotStats};
pub use motion::{AllowedDofs, MotionProperties, MotionQuality, MotionType, SleepState};
pub use mutex_array::{BodyMutex, MutexArray, MutexMask};
