//! Middleware composition.
//!
//! A [`Stage`] receives its input and forwards a possibly transformed input
//! to the rest of the chain through a [`Next`] continuation. Stages are
//! type-transforming: a stage may unwrap the [`RequestScope`], wrap its
//! handles (per-chunk logging, accounting) and forward something else
//! entirely, as long as the following stage accepts it. Because the handles
//! are single-owner and non-copyable, a stage moves its input into `next`
//! or consumes it fully; there is no way to keep a second ownership path.
//!
//! Composition is associative and ends in a terminal stage wrapping the
//! user [`Handler`]; the terminal stage's forwarded type is [`Never`], so it
//! cannot call `next` at all. [`ChainBuilder`] assembles a chain
//! declaratively, with conditional and optional stages.

use std::convert::Infallible;
use std::fmt::{self, Debug, Formatter};
use std::marker::PhantomData;

use futures_util::future::BoxFuture;

use crate::handler::Handler;
use crate::http::{RequestContext, RequestHead, RequestConcludingReader, ResponseSender};
use crate::service::Service;

/// Forwarded type of a terminal stage; uninhabited, so a terminal stage can
/// never invoke its continuation.
pub type Never = Infallible;

/// Everything a handler invocation owns for the lifetime of one exchange.
///
/// Ownership moves stage to stage through the chain; no stage may retain any
/// of it after forwarding.
pub struct RequestScope {
    /// The request head.
    pub request: RequestHead,
    /// Immutable per-request metadata.
    pub context: RequestContext,
    /// Single-shot body reading session.
    pub body_reader: RequestConcludingReader,
    /// Single-shot response capability.
    pub response_sender: ResponseSender,
}

impl Debug for RequestScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestScope")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

/// Continuation handing the (possibly transformed) input to the rest of the
/// chain.
pub struct Next<'a, I> {
    run: Box<dyn FnOnce(I) -> BoxFuture<'a, crate::Result<()>> + Send + 'a>,
}

impl<'a, I> Next<'a, I> {
    /// Build a continuation from a closure.
    pub fn new(f: impl FnOnce(I) -> BoxFuture<'a, crate::Result<()>> + Send + 'a) -> Self {
        Self { run: Box::new(f) }
    }

    /// Run the rest of the chain with `input`.
    pub fn run(self, input: I) -> BoxFuture<'a, crate::Result<()>> {
        (self.run)(input)
    }
}

impl<I> Debug for Next<'_, I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// One middleware stage.
pub trait Stage: Send + Sync + 'static {
    /// What this stage receives.
    type Input: Send + 'static;
    /// What this stage forwards to the rest of the chain.
    type Fwd: Send + 'static;

    /// Process `input`, forwarding through `next` at most once.
    fn intercept<'a>(
        &'a self,
        input: Self::Input,
        next: Next<'a, Self::Fwd>,
    ) -> BoxFuture<'a, crate::Result<()>>;
}

/// Two stages composed in sequence. Built by [`ChainBuilder::then`].
pub struct Chained<A, B> {
    outer: A,
    inner: B,
}

impl<A: Debug, B: Debug> Debug for Chained<A, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chained")
            .field("outer", &self.outer)
            .field("inner", &self.inner)
            .finish()
    }
}

impl<A, B> Stage for Chained<A, B>
where
    A: Stage,
    B: Stage<Input = A::Fwd>,
{
    type Input = A::Input;
    type Fwd = B::Fwd;

    fn intercept<'a>(
        &'a self,
        input: Self::Input,
        next: Next<'a, Self::Fwd>,
    ) -> BoxFuture<'a, crate::Result<()>> {
        let inner = &self.inner;
        self.outer
            .intercept(input, Next::new(move |fwd| inner.intercept(fwd, next)))
    }
}

/// Identity stage; forwards its input untouched.
pub struct Passthrough<I> {
    _marker: PhantomData<fn(I) -> I>,
}

impl<I> Passthrough<I> {
    /// Create the identity stage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<I> Default for Passthrough<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> Debug for Passthrough<I> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Passthrough").finish()
    }
}

impl<I: Send + 'static> Stage for Passthrough<I> {
    type Input = I;
    type Fwd = I;

    fn intercept<'a>(
        &'a self,
        input: I,
        next: Next<'a, I>,
    ) -> BoxFuture<'a, crate::Result<()>> {
        next.run(input)
    }
}

/// Either of two stages with the same input and forwarded types; how
/// [`ChainBuilder`] expresses conditional stages.
#[derive(Debug)]
pub enum Either<A, B> {
    /// The first stage.
    Left(A),
    /// The second stage.
    Right(B),
}

impl<A, B> Stage for Either<A, B>
where
    A: Stage,
    B: Stage<Input = A::Input, Fwd = A::Fwd>,
{
    type Input = A::Input;
    type Fwd = A::Fwd;

    fn intercept<'a>(
        &'a self,
        input: Self::Input,
        next: Next<'a, Self::Fwd>,
    ) -> BoxFuture<'a, crate::Result<()>> {
        match self {
            Self::Left(stage) => stage.intercept(input, next),
            Self::Right(stage) => stage.intercept(input, next),
        }
    }
}

/// Terminal stage: the user handler. Never calls its continuation.
pub struct Terminal<H> {
    handler: H,
}

impl<H> Terminal<H> {
    /// Wrap a handler as the terminal stage.
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

impl<H> Debug for Terminal<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Terminal").finish_non_exhaustive()
    }
}

impl<H: Handler> Stage for Terminal<H> {
    type Input = RequestScope;
    type Fwd = Never;

    fn intercept<'a>(
        &'a self,
        scope: RequestScope,
        _next: Next<'a, Never>,
    ) -> BoxFuture<'a, crate::Result<()>> {
        let RequestScope {
            request,
            context,
            body_reader,
            response_sender,
        } = scope;
        self.handler
            .handle(request, context, body_reader, response_sender)
    }
}

/// Declarative chain assembly.
///
/// Starts from an outermost stage (or [`ChainBuilder::root`] for none),
/// appends stages whose input matches the forwarded type so far, and
/// terminates in a handler, yielding a [`Service`].
#[derive(Debug)]
pub struct ChainBuilder<S> {
    stage: S,
}

impl ChainBuilder<Passthrough<RequestScope>> {
    /// Start an empty chain.
    #[must_use]
    pub fn root() -> Self {
        Self {
            stage: Passthrough::new(),
        }
    }
}

impl<S: Stage> ChainBuilder<S> {
    /// Start a chain from its outermost stage.
    pub fn new(stage: S) -> Self {
        Self { stage }
    }

    /// Append a stage.
    pub fn then<T>(self, stage: T) -> ChainBuilder<Chained<S, T>>
    where
        T: Stage<Input = S::Fwd>,
    {
        ChainBuilder {
            stage: Chained {
                outer: self.stage,
                inner: stage,
            },
        }
    }

    /// Append a stage only when `enabled`; otherwise the slot forwards
    /// untouched. The stage must not transform its input, since the chain's
    /// shape cannot depend on a runtime flag.
    pub fn then_if<T>(
        self,
        enabled: bool,
        stage: T,
    ) -> ChainBuilder<Chained<S, Either<T, Passthrough<S::Fwd>>>>
    where
        T: Stage<Input = S::Fwd, Fwd = S::Fwd>,
    {
        let stage = if enabled {
            Either::Left(stage)
        } else {
            Either::Right(Passthrough::new())
        };
        self.then(stage)
    }

    /// Append an optional stage; `None` forwards untouched.
    pub fn then_some<T>(
        self,
        stage: Option<T>,
    ) -> ChainBuilder<Chained<S, Either<T, Passthrough<S::Fwd>>>>
    where
        T: Stage<Input = S::Fwd, Fwd = S::Fwd>,
    {
        let stage = match stage {
            Some(stage) => Either::Left(stage),
            None => Either::Right(Passthrough::new()),
        };
        self.then(stage)
    }
}

impl<S> ChainBuilder<S>
where
    S: Stage<Input = RequestScope, Fwd = RequestScope>,
{
    /// Terminate the chain with the user handler.
    pub fn terminate<H: Handler>(self, handler: H) -> Service {
        Service::chained(Chained {
            outer: self.stage,
            inner: Terminal::new(handler),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    /// A stage that transforms its input type mid-chain.
    struct Tag {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Stage for Tag {
        type Input = Vec<&'static str>;
        type Fwd = Vec<&'static str>;

        fn intercept<'a>(
            &'a self,
            mut input: Vec<&'static str>,
            next: Next<'a, Vec<&'static str>>,
        ) -> BoxFuture<'a, crate::Result<()>> {
            input.push(self.label);
            *self.log.lock() = input.clone();
            next.run(input)
        }
    }

    struct Count;

    impl Stage for Count {
        type Input = Vec<&'static str>;
        type Fwd = usize;

        fn intercept<'a>(
            &'a self,
            input: Vec<&'static str>,
            next: Next<'a, usize>,
        ) -> BoxFuture<'a, crate::Result<()>> {
            next.run(input.len())
        }
    }

    struct Sink {
        seen: Arc<Mutex<Option<usize>>>,
    }

    impl Stage for Sink {
        type Input = usize;
        type Fwd = Never;

        fn intercept<'a>(
            &'a self,
            input: usize,
            _next: Next<'a, Never>,
        ) -> BoxFuture<'a, crate::Result<()>> {
            *self.seen.lock() = Some(input);
            Box::pin(async { Ok(()) })
        }
    }

    async fn run_chain<S>(chain: S, input: S::Input)
    where
        S: Stage<Fwd = Never>,
    {
        chain
            .intercept(input, Next::new(|never: Never| match never {}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stages_run_outermost_first_and_transform() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(None));
        let chain = Chained {
            outer: Tag {
                label: "a",
                log: log.clone(),
            },
            inner: Chained {
                outer: Tag {
                    label: "b",
                    log: log.clone(),
                },
                inner: Chained {
                    outer: Count,
                    inner: Sink { seen: seen.clone() },
                },
            },
        };
        run_chain(chain, vec![]).await;
        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert_eq!(*seen.lock(), Some(2));
    }

    #[tokio::test]
    async fn test_conditional_stage_skipped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::new(Mutex::new(None));
        let enabled: Either<Tag, Passthrough<Vec<&'static str>>> = Either::Left(Tag {
            label: "on",
            log: log.clone(),
        });
        let disabled: Either<Tag, Passthrough<Vec<&'static str>>> =
            Either::Right(Passthrough::new());
        let chain = Chained {
            outer: enabled,
            inner: Chained {
                outer: disabled,
                inner: Chained {
                    outer: Count,
                    inner: Sink { seen: seen.clone() },
                },
            },
        };
        run_chain(chain, vec![]).await;
        assert_eq!(*log.lock(), vec!["on"]);
        assert_eq!(*seen.lock(), Some(1));
    }
}
