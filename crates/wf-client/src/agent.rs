use std::sync::Arc;

use futures_util::StreamExt;
use tonic::Status;
use wf_proto::watchfire::{
    SubscribeAgentIssuesRequest, SubscribeRawOutputRequest, SubscribeScreenRequest,
};

use crate::channel::ControlChannel;
use crate::subscriptions::{EventStream, StreamEvent, StreamKind, StreamSource};

/// Agent server streams over the shared control channel.
pub struct AgentStreams {
    channel: Arc<ControlChannel>,
}

impl AgentStreams {
    pub fn new(channel: Arc<ControlChannel>) -> Self {
        Self { channel }
    }
}

#[tonic::async_trait]
impl StreamSource for AgentStreams {
    async fn open(&self, kind: StreamKind, subject: &str) -> Result<EventStream, Status> {
        let mut client = self
            .channel
            .agent_client()
            .map_err(|err| Status::unavailable(err.to_string()))?;
        let project_id = subject.to_string();

        let stream = match kind {
            StreamKind::Screen => client
                .subscribe_screen(SubscribeScreenRequest { project_id })
                .await?
                .into_inner()
                .map(|item| item.map(StreamEvent::Screen))
                .boxed(),
            StreamKind::Issues => client
                .subscribe_agent_issues(SubscribeAgentIssuesRequest { project_id })
                .await?
                .into_inner()
                .map(|item| item.map(|issue| StreamEvent::Issue(issue.into_active())))
                .boxed(),
            StreamKind::RawOutput => client
                .subscribe_raw_output(SubscribeRawOutputRequest { project_id })
                .await?
                .into_inner()
                .map(|item| item.map(|chunk| StreamEvent::RawOutput(chunk.data)))
                .boxed(),
        };
        Ok(stream)
    }
}
