mod codec;
mod pool;
mod session;
mod shared;
mod token;

pub use codec::{DynamicState, StateCodec};
pub use pool::{Checkout, DEFAULT_POOL_CAPACITY, ObjectPool};
pub use session::{DEFAULT_STORE_BYTES, SessionStateStore};
pub use shared::{
    DEFAULT_SHARED_CAPACITY, InstanceLoader, MapInstanceLoader, SharedInstanceCache,
    SharedInstanceKey,
};
pub use token::{PoolKey, SESSION_PREFIX, StateToken, TokenPair, new_session_id};
