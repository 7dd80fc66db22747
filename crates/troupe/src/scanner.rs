//! Directory scanner actor
//!
//! Asynchronous lookups are answered by this actor on a dispatcher thread so
//! callers never block on the directory.

use crate::{
    actor::{Actor, Context},
    address::Address,
    directory::ActorEntry,
    error::ActorResult,
    stage::Stage,
};
use std::fmt;
use std::sync::Arc;

type ScanReply = Box<dyn FnOnce(&Stage, Option<Arc<dyn ActorEntry>>) + Send>;

/// Look up `address` and hand the result to a callback
pub struct ScanRequest {
    address: Address,
    reply: ScanReply,
}

impl ScanRequest {
    pub fn new<F>(address: Address, reply: F) -> Self
    where
        F: FnOnce(&Stage, Option<Arc<dyn ActorEntry>>) + Send + 'static,
    {
        Self {
            address,
            reply: Box::new(reply),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }
}

impl fmt::Debug for ScanRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRequest")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Internal actor serving [`ScanRequest`]s
#[derive(Debug, Default)]
pub struct DirectoryScanner;

impl Actor for DirectoryScanner {
    type Protocol = ScanRequest;

    fn receive(&mut self, request: ScanRequest, ctx: &mut Context<'_, Self>) -> ActorResult<()> {
        let stage = ctx.stage();
        let entry = stage.directory().actor_of(&request.address);
        (request.reply)(stage, entry);
        Ok(())
    }
}
