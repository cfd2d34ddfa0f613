//! Release-layered command execution
//!
//! Handlers are registered per release layer. A command walks from the
//! host's release down towards the baseline; the first layer with a handler
//! for the command's kind runs it. A handler receives a [`Predecessor`] it
//! can call to run whatever the older layers would have done, which lets a
//! release wrap inherited behavior instead of copying it.

use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, info_span, warn, Instrument};

use crate::capability::CapabilityChain;
use crate::error::{XenhostError, XenhostResult};
use crate::session::HostContext;

pub mod baseline;
pub mod command;
pub mod releases;

pub use command::{Answer, AnswerPayload, Command, CommandKind, HostCapacity, HostStats};

pub type HandlerFuture<'a> = BoxFuture<'a, XenhostResult<Answer>>;

/// Command handler for one release layer
pub type Handler = for<'a> fn(&'a HostContext, &'a Command, Predecessor<'a>) -> HandlerFuture<'a>;

#[derive(Debug, Clone, Copy)]
enum Below {
    /// Release layers at chain positions lower than this, then the baseline
    Layer(usize),
    Nothing,
}

/// The inherited implementation of the running handler
#[derive(Clone, Copy)]
pub struct Predecessor<'a> {
    dispatcher: &'a CommandDispatcher,
    below: Below,
}

impl<'a> Predecessor<'a> {
    pub fn run(self, ctx: &'a HostContext, command: &'a Command) -> HandlerFuture<'a> {
        self.dispatcher.dispatch_from(self.below, ctx, command)
    }
}

pub struct CommandDispatcher {
    chain: Arc<CapabilityChain>,
    baseline: HashMap<CommandKind, Handler>,
    /// Keyed by the release's position in the chain
    layers: BTreeMap<usize, HashMap<CommandKind, Handler>>,
}

impl CommandDispatcher {
    pub fn new(chain: Arc<CapabilityChain>) -> Self {
        Self {
            chain,
            baseline: HashMap::new(),
            layers: BTreeMap::new(),
        }
    }

    pub fn register_baseline(&mut self, kind: CommandKind, handler: Handler) {
        self.baseline.insert(kind, handler);
    }

    pub fn register(&mut self, release: &str, kind: CommandKind, handler: Handler) -> XenhostResult<()> {
        let position = self.chain.position(release)?;
        self.layers.entry(position).or_default().insert(kind, handler);
        Ok(())
    }

    /// Check that the baseline handles every command kind
    pub fn validate(&self) -> XenhostResult<()> {
        let missing: Vec<String> = CommandKind::ALL
            .iter()
            .filter(|kind| !self.baseline.contains_key(kind))
            .map(|kind| kind.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(XenhostError::ConfigError(format!(
                "no baseline handler for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Name of the layer that handles `kind` for `release`
    pub fn handling_layer(&self, release: &str, kind: CommandKind) -> XenhostResult<String> {
        let position = self.chain.position(release)?;
        let layer = self
            .layers
            .range(..=position)
            .rev()
            .find(|(_, handlers)| handlers.contains_key(&kind))
            .map(|(pos, _)| *pos);

        match layer {
            Some(pos) => Ok(self
                .chain
                .releases()
                .nth(pos)
                .map(|tag| tag.name.clone())
                .unwrap_or_default()),
            None => Ok("baseline".to_string()),
        }
    }

    /// Run a command and turn any error into a failed answer
    pub async fn execute(&self, ctx: &HostContext, command: &Command) -> Answer {
        let kind = command.kind();
        let span = info_span!("command", kind = %kind, host = %ctx.host_uuid());

        async {
            info!(release = %ctx.release.name, "Executing command");
            match self.dispatch(ctx, command).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!("Command failed: {}", e);
                    Answer::failed(&e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run a command, propagating errors
    pub async fn dispatch(&self, ctx: &HostContext, command: &Command) -> XenhostResult<Answer> {
        let position = self.chain.position(&ctx.release.name)?;
        self.dispatch_from(Below::Layer(position + 1), ctx, command)
            .await
    }

    fn dispatch_from<'a>(
        &'a self,
        below: Below,
        ctx: &'a HostContext,
        command: &'a Command,
    ) -> HandlerFuture<'a> {
        let kind = command.kind();

        if let Below::Layer(upper) = below {
            let found = self
                .layers
                .range(..upper)
                .rev()
                .find_map(|(pos, handlers)| handlers.get(&kind).map(|h| (*pos, *h)));
            if let Some((pos, handler)) = found {
                let predecessor = Predecessor {
                    dispatcher: self,
                    below: Below::Layer(pos),
                };
                return handler(ctx, command, predecessor);
            }
        }

        if !matches!(below, Below::Nothing) {
            if let Some(handler) = self.baseline.get(&kind) {
                let predecessor = Predecessor {
                    dispatcher: self,
                    below: Below::Nothing,
                };
                return handler(ctx, command, predecessor);
            }
        }

        Box::pin(async move {
            Err(XenhostError::Unsupported {
                feature: kind.to_string(),
                release: ctx.release.name.clone(),
            })
        })
    }
}

/// Dispatcher with the baseline and the standard release layers
pub fn standard_dispatcher(chain: Arc<CapabilityChain>) -> XenhostResult<CommandDispatcher> {
    let mut dispatcher = CommandDispatcher::new(chain);
    baseline::register(&mut dispatcher);
    releases::register(&mut dispatcher)?;
    dispatcher.validate()?;
    Ok(dispatcher)
}

/// Error for a handler invoked with a command of another kind
pub(crate) fn unexpected(command: &Command) -> XenhostError {
    XenhostError::internal(format!("handler received {}", command.kind()))
}
