//! Activity dispatch
//!
//! Routes a received activity to exactly one handler:
//!
//! - a well-known type runs its wrapped default, then the application's
//!   override for that type, if any
//! - any other type runs the first matching application handler
//! - anything unclaimed runs the application's default callback
//!
//! An application handler whose matcher accepts a well-known type takes
//! that type over completely; the wrapped default no longer runs for it.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use url::Url;

use super::protocol::CallbackProvider;
use super::wrapped::WrappedDefaults;
use crate::activity::{Activity, ActivityType};
use crate::config::OnFollow;
use crate::context::RequestContext;
use crate::error::Result;
use crate::metrics::ACTIVITIES_DISPATCHED;

/// Application code run for a routed activity
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, activity: &Activity) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ActivityHandler for FnHandler<F>
where
    F: Fn(RequestContext, Activity) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, ctx: &RequestContext, activity: &Activity) -> Result<()> {
        (self.0)(ctx.clone(), activity.clone()).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ActivityHandler>
where
    F: Fn(RequestContext, Activity) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Application overrides for the well-known types
///
/// An override runs after the engine's default for its type. `on_follow`
/// tells the Follow default how to answer follows of a local actor.
#[derive(Clone, Default)]
pub struct WrappedCallbacks {
    pub create: Option<Arc<dyn ActivityHandler>>,
    pub update: Option<Arc<dyn ActivityHandler>>,
    pub delete: Option<Arc<dyn ActivityHandler>>,
    pub follow: Option<Arc<dyn ActivityHandler>>,
    pub accept: Option<Arc<dyn ActivityHandler>>,
    pub reject: Option<Arc<dyn ActivityHandler>>,
    pub add: Option<Arc<dyn ActivityHandler>>,
    pub remove: Option<Arc<dyn ActivityHandler>>,
    pub like: Option<Arc<dyn ActivityHandler>>,
    pub announce: Option<Arc<dyn ActivityHandler>>,
    pub undo: Option<Arc<dyn ActivityHandler>>,
    pub block: Option<Arc<dyn ActivityHandler>>,
    pub on_follow: OnFollow,
}

impl WrappedCallbacks {
    pub fn override_for(&self, kind: &ActivityType) -> Option<&Arc<dyn ActivityHandler>> {
        match kind {
            ActivityType::Create => self.create.as_ref(),
            ActivityType::Update => self.update.as_ref(),
            ActivityType::Delete => self.delete.as_ref(),
            ActivityType::Follow => self.follow.as_ref(),
            ActivityType::Accept => self.accept.as_ref(),
            ActivityType::Reject => self.reject.as_ref(),
            ActivityType::Add => self.add.as_ref(),
            ActivityType::Remove => self.remove.as_ref(),
            ActivityType::Like => self.like.as_ref(),
            ActivityType::Announce => self.announce.as_ref(),
            ActivityType::Undo => self.undo.as_ref(),
            ActivityType::Block => self.block.as_ref(),
            ActivityType::Other(_) => None,
        }
    }
}

type Matcher = Arc<dyn Fn(&ActivityType) -> bool + Send + Sync>;

/// Application handler for a type outside the wrapped set
#[derive(Clone)]
pub struct OtherHandler {
    label: String,
    matcher: Matcher,
    handler: Arc<dyn ActivityHandler>,
}

impl OtherHandler {
    /// Handle activities whose type is exactly `kind`
    pub fn for_type(kind: &str, handler: Arc<dyn ActivityHandler>) -> Self {
        let expected = ActivityType::parse(kind);
        Self {
            label: kind.to_string(),
            matcher: Arc::new(move |candidate| *candidate == expected),
            handler,
        }
    }

    /// Handle every activity type `predicate` accepts
    pub fn matching<P>(label: impl Into<String>, predicate: P, handler: Arc<dyn ActivityHandler>) -> Self
    where
        P: Fn(&ActivityType) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            matcher: Arc::new(predicate),
            handler,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn matches(&self, kind: &ActivityType) -> bool {
        (self.matcher)(kind)
    }
}

/// Where an activity was routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Wrapped default plus optional override
    Wrapped,
    /// Application handler at this index
    Other(usize),
    /// Application default callback
    Default,
}

impl Route {
    fn label(&self) -> &'static str {
        match self {
            Route::Wrapped => "wrapped",
            Route::Other(_) => "other",
            Route::Default => "default",
        }
    }
}

/// Routing decisions for one set of callbacks
pub struct DispatchTable {
    wrapped: WrappedCallbacks,
    others: Vec<OtherHandler>,
    shadowed: HashSet<ActivityType>,
}

impl DispatchTable {
    pub fn new(wrapped: WrappedCallbacks, others: Vec<OtherHandler>) -> Self {
        let shadowed: HashSet<ActivityType> = ActivityType::WELL_KNOWN
            .iter()
            .filter(|kind| others.iter().any(|handler| handler.matches(kind)))
            .cloned()
            .collect();

        for kind in &shadowed {
            tracing::debug!(activity_type = %kind, "Wrapped default replaced by application handler");
        }

        Self {
            wrapped,
            others,
            shadowed,
        }
    }

    pub fn route(&self, kind: &ActivityType) -> Route {
        if kind.is_well_known() && !self.shadowed.contains(kind) {
            return Route::Wrapped;
        }
        match self.others.iter().position(|handler| handler.matches(kind)) {
            Some(index) => Route::Other(index),
            None => Route::Default,
        }
    }

    pub fn on_follow(&self) -> OnFollow {
        self.wrapped.on_follow
    }
}

/// Runs the handler chosen by the dispatch table
///
/// The table is built from the application's callbacks on first use and
/// reused for the lifetime of the dispatcher.
pub struct Dispatcher {
    callbacks: Arc<dyn CallbackProvider>,
    defaults: WrappedDefaults,
    table: OnceCell<Arc<DispatchTable>>,
}

impl Dispatcher {
    pub fn new(callbacks: Arc<dyn CallbackProvider>, defaults: WrappedDefaults) -> Self {
        Self {
            callbacks,
            defaults,
            table: OnceCell::new(),
        }
    }

    async fn table(&self, ctx: &RequestContext) -> Result<Arc<DispatchTable>> {
        self.table
            .get_or_try_init(|| async {
                let (wrapped, others) = self.callbacks.federating_callbacks(ctx).await?;
                Ok(Arc::new(DispatchTable::new(wrapped, others)))
            })
            .await
            .cloned()
    }

    /// Run the one handler `activity` routes to
    ///
    /// # Errors
    /// Whatever the handler returns, unchanged. `ObjectRequired` and
    /// `TargetRequired` from a wrapped default mark the activity as
    /// malformed.
    pub async fn dispatch(
        &self,
        ctx: &RequestContext,
        inbox: &Url,
        activity: &Activity,
    ) -> Result<Route> {
        let table = self.table(ctx).await?;
        let route = table.route(&activity.kind);

        tracing::debug!(
            activity_type = %activity.kind,
            route = route.label(),
            "Dispatching activity"
        );
        ACTIVITIES_DISPATCHED
            .with_label_values(&[route.label()])
            .inc();

        ctx.run(async {
            match &route {
                Route::Wrapped => {
                    self.defaults
                        .apply(ctx, inbox, activity, table.on_follow())
                        .await?;
                    if let Some(handler) = table.wrapped.override_for(&activity.kind) {
                        handler.handle(ctx, activity).await?;
                    }
                }
                Route::Other(index) => {
                    table.others[*index].handler.handle(ctx, activity).await?;
                }
                Route::Default => {
                    self.callbacks.default_callback(ctx, activity).await?;
                }
            }
            Ok(())
        })
        .await?;

        Ok(route)
    }
}
