use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tracing::info;
use wf_proto::watchfire::agent_service_client::AgentServiceClient;
use wf_proto::watchfire::daemon_service_client::DaemonServiceClient;
use wf_proto::watchfire::project_service_client::ProjectServiceClient;
use wf_supervisor::ConnectionDescriptor;

use crate::error::ChannelError;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

struct Bound {
    endpoint: String,
    channel: Channel,
}

/// The one transport every typed client is created from. Re-initialising
/// replaces the previous transport; clients created earlier keep using
/// the old one until they are dropped.
pub struct ControlChannel {
    current: RwLock<Option<Bound>>,
    rpc_timeout: Duration,
    connect_timeout: Duration,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl ControlChannel {
    pub fn new(rpc_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            rpc_timeout,
            connect_timeout,
        }
    }

    /// Binds the channel to `host:port`. The connection itself is made
    /// lazily on the first call.
    pub fn init(&self, host: &str, port: u16) -> Result<(), ChannelError> {
        let endpoint = format!("http://{host}:{port}");
        let channel = Endpoint::from_shared(endpoint.clone())
            .map_err(|source| ChannelError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                source,
            })?
            .timeout(self.rpc_timeout)
            .connect_timeout(self.connect_timeout)
            .connect_lazy();

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|bound| bound.endpoint.as_str()) != Some(endpoint.as_str()) {
            info!("control channel bound to {endpoint}");
        }
        *current = Some(Bound { endpoint, channel });
        Ok(())
    }

    pub fn init_from(&self, descriptor: &ConnectionDescriptor) -> Result<(), ChannelError> {
        self.init(descriptor.host(), descriptor.port)
    }

    pub fn get(&self) -> Result<Channel, ChannelError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|bound| bound.channel.clone())
            .ok_or(ChannelError::NotInitialized)
    }

    pub fn endpoint(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|bound| bound.endpoint.clone())
    }

    pub fn agent_client(&self) -> Result<AgentServiceClient<Channel>, ChannelError> {
        Ok(AgentServiceClient::new(self.get()?))
    }

    pub fn daemon_client(&self) -> Result<DaemonServiceClient<Channel>, ChannelError> {
        Ok(DaemonServiceClient::new(self.get()?))
    }

    pub fn project_client(&self) -> Result<ProjectServiceClient<Channel>, ChannelError> {
        Ok(ProjectServiceClient::new(self.get()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_before_init_is_distinct_error() {
        let channel = ControlChannel::default();
        assert!(matches!(channel.get(), Err(ChannelError::NotInitialized)));
        assert!(matches!(
            channel.daemon_client(),
            Err(ChannelError::NotInitialized)
        ));
        assert!(channel.endpoint().is_none());
    }

    #[tokio::test]
    async fn init_replaces_previous_endpoint() {
        let channel = ControlChannel::default();
        channel.init("localhost", 7000).unwrap();
        assert_eq!(channel.endpoint().as_deref(), Some("http://localhost:7000"));

        let descriptor = ConnectionDescriptor::new("127.0.0.1", 7100, 1);
        channel.init_from(&descriptor).unwrap();
        assert_eq!(channel.endpoint().as_deref(), Some("http://127.0.0.1:7100"));
        assert!(channel.agent_client().is_ok());
    }

    #[tokio::test]
    async fn malformed_host_is_rejected() {
        let channel = ControlChannel::default();
        let err = channel.init("bad host", 7000).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidEndpoint { .. }));
        assert!(channel.get().is_err());
    }
}
