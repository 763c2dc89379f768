use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use poise::serenity_prelude as serenity;
use serenity::prelude::TypeMapKey;

use crate::moderation::Moderator;

/// Shared state handed to every command
pub struct DataInner {
    pub moderator: Arc<Moderator>,
    /// Gateway connection state, shared with the event handler and the backend
    pub ready: Arc<AtomicBool>,
}

/// Centralized data structure for the bot
#[derive(Clone)]
pub struct Data(pub Arc<DataInner>);

// Implement TypeMapKey for Data to allow storing it in Serenity's data map
impl TypeMapKey for Data {
    type Value = Data;
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("moderator", &self.moderator)
            .field("ready", &self.is_connected())
            .finish()
    }
}

impl Deref for Data {
    type Target = DataInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Data {
    #[must_use]
    pub fn new(moderator: Arc<Moderator>, ready: Arc<AtomicBool>) -> Self {
        Self(Arc::new(DataInner { moderator, ready }))
    }

    /// Get the moderator
    #[must_use]
    pub fn moderator(&self) -> &Moderator {
        &self.0.moderator
    }

    /// Whether the gateway connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.0.ready.load(Ordering::SeqCst)
    }
}
