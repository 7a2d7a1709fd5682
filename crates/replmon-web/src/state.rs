//! Shared application state and the global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use axum::extract::State;

use replmon_core::hub::BroadcastHub;

pub(crate) type SharedState = Arc<BroadcastHub>;

pub(crate) type AppState = State<SharedState>;
