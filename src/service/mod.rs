//! Echo service: every call shape a client library has to support.
//!
//! All behavior is driven by the request itself:
//! - `content` is echoed back, whole or word by word
//! - `error` makes the call fail with exactly that status
//! - `showcase-trailer` metadata is echoed back as trailers on success
//! - `response_delay` (Block) holds the response back
//!
//! ## Call shapes
//!
//! | Method              | Shape            |
//! |---------------------|------------------|
//! | `Echo`              | unary            |
//! | `Expand`            | server streaming |
//! | `Collect`           | client streaming |
//! | `Chat`              | bidirectional    |
//! | `PagedExpand`       | unary, paged     |
//! | `PagedExpandLegacy` | unary, paged     |
//! | `Block`             | unary, delayed   |
//! | `Wait`              | unary, returns a long-running operation |
//!
//! Streaming inputs are `Stream`s of `Result<EchoRequest, Status>`: `None`
//! is the natural end of input, `Some(Err(_))` a transport failure.
//! Streaming outputs go through a bounded channel to the transport.

pub mod context;
pub mod paging;
pub mod types;
pub mod words;

use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::status::{self, Status};
use crate::waiter::Waiter;
use context::CallContext;
use types::{
    BlockRequest, BlockResponse, EchoRequest, EchoResponse, Operation, PagedExpandLegacyRequest,
    PagedExpandRequest, PagedExpandResponse, WaitRequest,
};

/// Fully qualified service name.
pub const ECHO_SERVICE: &str = "google.showcase.v1beta1.Echo";

/// Echo service; the waiter is its only collaborator.
#[derive(Clone)]
pub struct EchoService {
    waiter: Arc<dyn Waiter>,
}

impl EchoService {
    pub fn new(waiter: Arc<dyn Waiter>) -> Self {
        EchoService { waiter }
    }

    /// Echo content and severity back.
    pub fn echo(&self, ctx: &mut CallContext, request: EchoRequest) -> Result<EchoResponse, Status> {
        status::resolve(request.error.as_ref())?;
        ctx.echo_trailers();
        Ok(EchoResponse {
            content: request.content,
            severity: request.severity,
        })
    }

    /// Stream the words of `content` back one message per word.
    ///
    /// Every word is sent before an injected error is reported, and the
    /// error path skips trailers.
    pub async fn expand(
        &self,
        ctx: &mut CallContext,
        request: EchoRequest,
        responses: mpsc::Sender<EchoResponse>,
    ) -> Result<(), Status> {
        let words = words::words(&request.content);
        debug!(words = words.len(), "Expanding content");

        for word in words {
            send(&responses, EchoResponse::content(word)).await?;
        }

        status::resolve(request.error.as_ref())?;
        ctx.echo_trailers();
        Ok(())
    }

    /// Join the non-empty contents of every inbound message with single spaces.
    pub async fn collect<S>(&self, ctx: &mut CallContext, mut requests: S) -> Result<EchoResponse, Status>
    where
        S: Stream<Item = Result<EchoRequest, Status>> + Unpin,
    {
        let mut collected: Vec<String> = Vec::new();

        while let Some(request) = requests.next().await {
            let request = request?;
            status::resolve(request.error.as_ref())?;
            if !request.content.is_empty() {
                collected.push(request.content);
            }
        }

        debug!(messages = collected.len(), "Collect input finished");
        ctx.echo_trailers();
        Ok(EchoResponse::content(collected.join(" ")))
    }

    /// Echo each inbound message as soon as it arrives.
    pub async fn chat<S>(
        &self,
        ctx: &mut CallContext,
        mut requests: S,
        responses: mpsc::Sender<EchoResponse>,
    ) -> Result<(), Status>
    where
        S: Stream<Item = Result<EchoRequest, Status>> + Unpin,
    {
        while let Some(request) = requests.next().await {
            let request = request?;
            status::resolve(request.error.as_ref())?;
            send(&responses, EchoResponse::content(request.content)).await?;
        }

        ctx.echo_trailers();
        Ok(())
    }

    /// Return one page of the words of `content`.
    pub fn paged_expand(
        &self,
        ctx: &mut CallContext,
        request: PagedExpandRequest,
    ) -> Result<PagedExpandResponse, Status> {
        let words = words::words(&request.content);
        let page = paging::paginate(words.len(), request.page_size, &request.page_token)?;

        let responses = words[page.start..page.end]
            .iter()
            .map(|word| EchoResponse::content(*word))
            .collect();

        ctx.echo_trailers();
        Ok(PagedExpandResponse {
            responses,
            next_page_token: page.next_page_token,
        })
    }

    /// [`paged_expand`](Self::paged_expand) with `max_results` as the page size.
    pub fn paged_expand_legacy(
        &self,
        ctx: &mut CallContext,
        request: PagedExpandLegacyRequest,
    ) -> Result<PagedExpandResponse, Status> {
        self.paged_expand(ctx, request.into())
    }

    /// Wait `response_delay`, then fail with `error` or return `success`.
    ///
    /// Only this call is suspended. Cancellation by the peer during the
    /// delay ends the call with `Cancelled`.
    pub async fn block(&self, ctx: &mut CallContext, request: BlockRequest) -> Result<BlockResponse, Status> {
        let delay = request.response_delay.to_std();
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "Blocking");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancellation().cancelled() => {
                    return Err(Status::cancelled("call cancelled while blocking"));
                }
            }
        }

        status::resolve(request.error.as_ref())?;
        ctx.echo_trailers();
        Ok(request.success.unwrap_or_default())
    }

    /// Start a long-running operation through the waiter.
    pub fn wait(&self, ctx: &mut CallContext, request: WaitRequest) -> Result<Operation, Status> {
        let operation = self.waiter.wait(request)?;
        ctx.echo_trailers();
        Ok(operation)
    }

    /// Poll an operation started by [`wait`](Self::wait).
    pub fn get_operation(&self, ctx: &mut CallContext, name: &str) -> Result<Operation, Status> {
        let operation = self.waiter.get_operation(name)?;
        ctx.echo_trailers();
        Ok(operation)
    }
}

/// Hand one message to the transport; fails once the peer side is gone.
async fn send(responses: &mpsc::Sender<EchoResponse>, response: EchoResponse) -> Result<(), Status> {
    responses
        .send(response)
        .await
        .map_err(|_| Status::cancelled("response stream closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, TRAILER_KEY};
    use crate::service::context::Cancellation;
    use crate::service::types::{ProtoDuration, Severity};
    use crate::status::Code;
    use crate::waiter::InMemoryWaiter;
    use futures_util::stream;
    use std::time::{Duration, Instant};

    fn service() -> EchoService {
        EchoService::new(Arc::new(InMemoryWaiter::new()))
    }

    fn plain_ctx() -> CallContext {
        CallContext::new(Metadata::new(), Cancellation::never())
    }

    fn trailer_ctx() -> CallContext {
        let metadata: Metadata = [(TRAILER_KEY, "x"), (TRAILER_KEY, "y")].into_iter().collect();
        CallContext::new(metadata, Cancellation::never())
    }

    fn trailer_values(ctx: &CallContext) -> Vec<String> {
        ctx.trailers()
            .get_all(TRAILER_KEY)
            .map(str::to_string)
            .collect()
    }

    fn request(content: &str) -> EchoRequest {
        EchoRequest {
            content: content.to_string(),
            ..Default::default()
        }
    }

    fn failing(content: &str) -> EchoRequest {
        EchoRequest {
            content: content.to_string(),
            error: Some(Status::new(Code::Aborted, "injected")),
            ..Default::default()
        }
    }

    fn contents(responses: &[EchoResponse]) -> Vec<&str> {
        responses.iter().map(|r| r.content.as_str()).collect()
    }

    /// Run a streaming call while draining its output channel.
    async fn drain<F, T>(call: F, mut rx: mpsc::Receiver<EchoResponse>) -> (T, Vec<EchoResponse>)
    where
        F: std::future::Future<Output = T>,
    {
        let collect = async {
            let mut out = Vec::new();
            while let Some(response) = rx.recv().await {
                out.push(response);
            }
            out
        };
        tokio::join!(call, collect)
    }

    #[test]
    fn test_echo_returns_content_and_severity() {
        let mut ctx = trailer_ctx();
        let response = service()
            .echo(
                &mut ctx,
                EchoRequest {
                    content: "hello".to_string(),
                    severity: Severity::Critical,
                    error: None,
                },
            )
            .unwrap();

        assert_eq!(response.content, "hello");
        assert_eq!(response.severity, Severity::Critical);
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[test]
    fn test_echo_injected_error_skips_trailers() {
        let mut ctx = trailer_ctx();
        let err = service().echo(&mut ctx, failing("hello")).unwrap_err();
        assert_eq!(err, Status::new(Code::Aborted, "injected"));
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_expand_streams_each_word() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);

        let (result, out) = drain(
            service.expand(&mut ctx, request("the quick  brown\tfox"), tx),
            rx,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(contents(&out), vec!["the", "quick", "brown", "fox"]);
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_expand_sends_words_before_injected_error() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);

        let (result, out) = drain(service.expand(&mut ctx, failing("a b"), tx), rx).await;

        assert_eq!(result.unwrap_err().code, Code::Aborted);
        assert_eq!(contents(&out), vec!["a", "b"]);
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_expand_empty_content() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);

        let (result, out) = drain(service.expand(&mut ctx, request("   "), tx), rx).await;

        assert!(result.is_ok());
        assert!(out.is_empty());
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_expand_fails_when_receiver_gone() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = service
            .expand(&mut ctx, request("a b"), tx)
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Cancelled);
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_collect_joins_contents() {
        let mut ctx = trailer_ctx();
        let input = stream::iter(vec![Ok(request("a")), Ok(request("b")), Ok(request("c"))]);

        let response = service().collect(&mut ctx, input).await.unwrap();
        assert_eq!(response.content, "a b c");
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_collect_skips_empty_messages() {
        let mut ctx = plain_ctx();
        let input = stream::iter(vec![Ok(request("a")), Ok(request("")), Ok(request("b"))]);

        let response = service().collect(&mut ctx, input).await.unwrap();
        assert_eq!(response.content, "a b");
    }

    #[tokio::test]
    async fn test_collect_no_input() {
        let mut ctx = plain_ctx();
        let input = stream::iter(Vec::<Result<EchoRequest, Status>>::new());

        let response = service().collect(&mut ctx, input).await.unwrap();
        assert_eq!(response.content, "");
    }

    #[tokio::test]
    async fn test_collect_injected_error_aborts() {
        let mut ctx = trailer_ctx();
        let input = stream::iter(vec![Ok(request("a")), Ok(failing("b")), Ok(request("c"))]);

        let err = service().collect(&mut ctx, input).await.unwrap_err();
        assert_eq!(err, Status::new(Code::Aborted, "injected"));
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_collect_transport_failure_propagates() {
        let mut ctx = plain_ctx();
        let input = stream::iter(vec![
            Ok(request("a")),
            Err(Status::cancelled("peer went away")),
        ]);

        let err = service().collect(&mut ctx, input).await.unwrap_err();
        assert_eq!(err.code, Code::Cancelled);
    }

    #[tokio::test]
    async fn test_chat_echoes_in_order() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);
        let input = stream::iter(vec![Ok(request("m1")), Ok(request("m2")), Ok(request("m3"))]);

        let (result, out) = drain(service.chat(&mut ctx, input, tx), rx).await;

        assert!(result.is_ok());
        assert_eq!(contents(&out), vec!["m1", "m2", "m3"]);
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_chat_stops_at_injected_error() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);
        let input = stream::iter(vec![Ok(request("m1")), Ok(failing("m2")), Ok(request("m3"))]);

        let (result, out) = drain(service.chat(&mut ctx, input, tx), rx).await;

        assert_eq!(result.unwrap_err().code, Code::Aborted);
        assert_eq!(contents(&out), vec!["m1"]);
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_chat_fails_when_receiver_gone() {
        let service = service();
        let mut ctx = trailer_ctx();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let input = stream::iter(vec![Ok(request("m1"))]);

        let err = service.chat(&mut ctx, input, tx).await.unwrap_err();
        assert_eq!(err.code, Code::Cancelled);
        assert!(ctx.trailers().is_empty());
    }

    #[test]
    fn test_paged_expand_walks_pages() {
        let service = service();
        let content = "one two three four five";
        let mut token = String::new();
        let mut pages = Vec::new();

        loop {
            let mut ctx = plain_ctx();
            let response = service
                .paged_expand(
                    &mut ctx,
                    PagedExpandRequest {
                        content: content.to_string(),
                        page_size: 2,
                        page_token: token.clone(),
                    },
                )
                .unwrap();
            pages.push((
                contents(&response.responses)
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                response.next_page_token.clone(),
            ));
            if response.next_page_token.is_empty() {
                break;
            }
            token = response.next_page_token;
        }

        assert_eq!(
            pages,
            vec![
                (vec!["one".to_string(), "two".to_string()], "2".to_string()),
                (vec!["three".to_string(), "four".to_string()], "4".to_string()),
                (vec!["five".to_string()], String::new()),
            ]
        );
    }

    #[test]
    fn test_paged_expand_zero_page_size_returns_all() {
        let mut ctx = trailer_ctx();
        let response = service()
            .paged_expand(
                &mut ctx,
                PagedExpandRequest {
                    content: "a b c".to_string(),
                    page_size: 0,
                    page_token: String::new(),
                },
            )
            .unwrap();

        assert_eq!(contents(&response.responses), vec!["a", "b", "c"]);
        assert_eq!(response.next_page_token, "");
        assert!(response
            .responses
            .iter()
            .all(|r| r.severity == Severity::default()));
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[test]
    fn test_paged_expand_rejects_bad_token() {
        let mut ctx = trailer_ctx();
        let err = service()
            .paged_expand(
                &mut ctx,
                PagedExpandRequest {
                    content: "a b c".to_string(),
                    page_size: 1,
                    page_token: "3".to_string(),
                },
            )
            .unwrap_err();

        assert_eq!(err.code, Code::InvalidArgument);
        assert!(err.message.contains("[0, 3)"));
        assert!(ctx.trailers().is_empty());
    }

    #[test]
    fn test_paged_expand_legacy_uses_max_results() {
        let mut ctx = plain_ctx();
        let response = service()
            .paged_expand_legacy(
                &mut ctx,
                PagedExpandLegacyRequest {
                    content: "a b c".to_string(),
                    max_results: 1,
                    page_token: "1".to_string(),
                },
            )
            .unwrap();

        assert_eq!(contents(&response.responses), vec!["b"]);
        assert_eq!(response.next_page_token, "2");
    }

    #[tokio::test]
    async fn test_block_error_without_delay() {
        let mut ctx = trailer_ctx();
        let started = Instant::now();
        let err = service()
            .block(
                &mut ctx,
                BlockRequest {
                    error: Some(Status::new(Code::Unavailable, "try later")),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err, Status::new(Code::Unavailable, "try later"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(ctx.trailers().is_empty());
    }

    #[tokio::test]
    async fn test_block_waits_before_success() {
        let mut ctx = trailer_ctx();
        let started = Instant::now();
        let response = service()
            .block(
                &mut ctx,
                BlockRequest {
                    response_delay: ProtoDuration::from_millis(50),
                    success: Some(BlockResponse {
                        content: "late".to_string(),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(response.content, "late");
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_block_cancelled_during_delay() {
        let (handle, cancellation) = Cancellation::new();
        let mut ctx = CallContext::new(Metadata::new(), cancellation);
        let service = service();

        let call = service.block(
            &mut ctx,
            BlockRequest {
                response_delay: ProtoDuration {
                    seconds: 30,
                    nanos: 0,
                },
                ..Default::default()
            },
        );
        let cancel = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.cancel();
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(call, cancel)
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap_err().code, Code::Cancelled);
    }

    #[test]
    fn test_wait_delegates_to_waiter() {
        let service = service();
        let mut ctx = trailer_ctx();
        let operation = service.wait(&mut ctx, WaitRequest::default()).unwrap();

        assert!(operation.done);
        assert_eq!(trailer_values(&ctx), vec!["x", "y"]);

        let mut ctx = plain_ctx();
        let polled = service.get_operation(&mut ctx, &operation.name).unwrap();
        assert_eq!(polled.name, operation.name);
    }
}
