use async_trait::async_trait;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::UgvError;

/// A long-running unit of work driven from the main join set.
#[async_trait]
pub trait Task {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// A request paired with the oneshot the handler resolves it on.
pub type Command<Req, Res> = (Req, oneshot::Sender<Result<Res, UgvError>>);
pub type ChannelCommandSink<Req, Res> = flume::Sender<Command<Req, Res>>;
pub type ChannelCommandSource<Req, Res> = flume::Receiver<Command<Req, Res>>;

#[async_trait]
pub trait CommandSink {
    type Request;
    type Response;

    async fn command(&self, request: Self::Request) -> Self::Response;
}

#[async_trait]
impl<Req: Send, Res: Send> CommandSink for ChannelCommandSink<Req, Res> {
    type Request = Req;
    type Response = Result<Res, UgvError>;

    async fn command(&self, request: Self::Request) -> Self::Response {
        let (tx, rx) = oneshot::channel();
        if self.send_async((request, tx)).await.is_err() {
            return Err(UgvError::General(anyhow::anyhow!(
                "control task is not running"
            )));
        }
        rx.await.map_err(|_| {
            UgvError::General(anyhow::anyhow!("control task dropped the request"))
        })?
    }
}
