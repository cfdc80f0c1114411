use once_cell::sync::Lazy;
use std::sync::Arc;

use crate::shared::config::model::{Settings, load_settings};

/// Process-wide settings, loaded once on first access. Cache construction
/// goes through an explicit `CacheConfig` (`CacheHandle::build`), so only
/// `logging::init` and embedding hosts reach for this global.
pub static CONFIG: Lazy<Arc<Settings>> =
    Lazy::new(|| Arc::new(load_settings().expect("Failed to load configuration")));
