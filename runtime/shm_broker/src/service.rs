//! Cross-domain call service
//!
//! Models the synchronous invocation path between client domains and the
//! broker domain:
//! - a [`BrokerClient`] is bound to one domain, the way an invocation
//!   capability carries the caller's badge; clients never name themselves
//! - each call sends a request and blocks until the broker replies
//! - the [`BrokerServer`] receives calls from every client and answers them
//!   one at a time
//!
//! Requests from different domains interleave freely at the server; the
//! broker's own lock serializes the state they touch.

use crate::{DomainId, Handle, MemoryPlatform, RegionBroker, Result, ShmError, VirtAddr};
use crossbeam::channel::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Operations a client domain can invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Allocate a region of `pages` pages
    Allocate { pages: usize },
    /// Map an existing region into the caller
    Attach { handle: Handle },
    /// Caller-local address of a region
    Resolve { handle: Handle },
    /// Give a region back
    Release { handle: Handle },
}

/// Successful results, one per [`Request`] variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Allocated(Handle),
    Attached,
    Resolved(VirtAddr),
    Released,
}

impl Reply {
    /// Reply as a single non-negative machine word
    ///
    /// Allocate yields the handle and resolve yields the page number of the
    /// address (`vaddr / page_size`); the other replies carry no value and
    /// yield 0. Errors use the negative [`ShmError::code`] instead.
    ///
    /// `page_size` must be at least 2, which [`crate::BrokerConfig::validate`]
    /// guarantees.
    pub fn as_word(self, page_size: usize) -> isize {
        match self {
            Reply::Allocated(handle) => handle.0 as isize,
            Reply::Resolved(vaddr) => (vaddr.as_usize() / page_size) as isize,
            Reply::Attached | Reply::Released => 0,
        }
    }
}

struct Call {
    caller: DomainId,
    request: Request,
    reply: Sender<Result<Reply>>,
}

/// Create the server side and a client endpoint factory for `broker`
pub fn endpoint<P: MemoryPlatform>(broker: Arc<RegionBroker<P>>) -> (BrokerServer<P>, Endpoint) {
    let (tx, rx) = channel::unbounded();
    (BrokerServer { broker, rx }, Endpoint { tx })
}

/// Hands out per-domain clients
///
/// The server keeps running while any endpoint or client is alive.
#[derive(Clone)]
pub struct Endpoint {
    tx: Sender<Call>,
}

impl Endpoint {
    /// Client whose calls are made on behalf of `domain`
    pub fn client(&self, domain: DomainId) -> BrokerClient {
        BrokerClient {
            domain,
            tx: self.tx.clone(),
        }
    }
}

/// A domain's handle on the broker
#[derive(Clone)]
pub struct BrokerClient {
    domain: DomainId,
    tx: Sender<Call>,
}

impl BrokerClient {
    /// Domain this client calls as
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Send `request` and block until the broker replies
    ///
    /// # Errors
    /// The broker's typed error, or `BrokerUnavailable` if the server is gone
    pub fn call(&self, request: Request) -> Result<Reply> {
        let (reply, rx) = channel::bounded(1);
        self.tx
            .send(Call {
                caller: self.domain,
                request,
                reply,
            })
            .map_err(|_| ShmError::BrokerUnavailable)?;

        rx.recv().map_err(|_| ShmError::BrokerUnavailable)?
    }

    /// Allocate a region of `pages` pages mapped into this domain
    pub fn allocate(&self, pages: usize) -> Result<Handle> {
        match self.call(Request::Allocate { pages })? {
            Reply::Allocated(handle) => Ok(handle),
            other => Err(unexpected(other)),
        }
    }

    /// Map the region behind `handle` into this domain
    pub fn attach(&self, handle: Handle) -> Result<()> {
        match self.call(Request::Attach { handle })? {
            Reply::Attached => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Where `handle` is mapped in this domain
    pub fn resolve(&self, handle: Handle) -> Result<VirtAddr> {
        match self.call(Request::Resolve { handle })? {
            Reply::Resolved(vaddr) => Ok(vaddr),
            other => Err(unexpected(other)),
        }
    }

    /// Give `handle` back (not implemented by the broker)
    pub fn release(&self, handle: Handle) -> Result<()> {
        match self.call(Request::Release { handle })? {
            Reply::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: Reply) -> ShmError {
    log::error!("reply {:?} does not match the request", reply);
    ShmError::UnexpectedReply
}

/// Broker side of the call path
pub struct BrokerServer<P: MemoryPlatform> {
    broker: Arc<RegionBroker<P>>,
    rx: Receiver<Call>,
}

impl<P: MemoryPlatform> BrokerServer<P> {
    /// Broker this server dispatches to
    pub fn broker(&self) -> &Arc<RegionBroker<P>> {
        &self.broker
    }

    /// Execute one request on behalf of `caller`
    pub fn dispatch(&self, caller: DomainId, request: Request) -> Result<Reply> {
        match request {
            Request::Allocate { pages } => self.broker.allocate(caller, pages).map(Reply::Allocated),
            Request::Attach { handle } => self.broker.attach(caller, handle).map(|()| Reply::Attached),
            Request::Resolve { handle } => self.broker.resolve(caller, handle).map(Reply::Resolved),
            Request::Release { handle } => self.broker.release(handle).map(|()| Reply::Released),
        }
    }

    /// Execute one request and encode the result as a single status word
    ///
    /// # Returns
    /// [`Reply::as_word`] on success, the negative [`ShmError::code`] on failure
    pub fn dispatch_word(&self, caller: DomainId, request: Request) -> isize {
        let result = self.dispatch(caller, request);
        self.status_word(&result)
    }

    fn status_word(&self, result: &Result<Reply>) -> isize {
        match result {
            Ok(reply) => reply.as_word(self.broker.config().page_size),
            Err(err) => err.code(),
        }
    }

    /// Wait for one call and answer it
    ///
    /// # Returns
    /// `false` once every endpoint and client has been dropped
    pub fn serve_one(&self) -> bool {
        let Ok(call) = self.rx.recv() else {
            return false;
        };

        let result = self.dispatch(call.caller, call.request);
        match &result {
            Ok(_) => log::debug!(
                "{:?} from {} -> {}",
                call.request,
                call.caller,
                self.status_word(&result)
            ),
            Err(err) => log::debug!(
                "{:?} from {} failed ({}): {}",
                call.request,
                call.caller,
                err.code(),
                err
            ),
        }
        if call.reply.send(result).is_err() {
            log::warn!("{} went away before its reply was delivered", call.caller);
        }
        true
    }

    /// Serve calls until all clients are gone
    ///
    /// # Returns
    /// Number of calls served
    pub fn run(self) -> usize {
        log::info!("broker {} serving calls", self.broker.domain());
        let mut served = 0;
        while self.serve_one() {
            served += 1;
        }
        log::info!("broker {} stopped after {} calls", self.broker.domain(), served);
        served
    }
}

impl<P> BrokerServer<P>
where
    P: MemoryPlatform + Send + Sync + 'static,
    P::Page: Send,
{
    /// Run the server on its own thread
    pub fn spawn(self) -> JoinHandle<usize> {
        thread::spawn(move || self.run())
    }
}
