use std::io;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("host interface name '{0}' is already in use")]
    NameCollision(String),

    #[error("invalid interface name '{0}'")]
    InvalidName(String),

    #[error("no such host interface '{0}'")]
    MissingLink(String),

    #[error("adapter {mac} is already plugged into network {network}")]
    AlreadyPlugged { mac: String, network: u64 },

    #[error("{0}")]
    Topology(String),

    #[error("unexpected output from host tool: {0}")]
    Parse(String),
}

impl From<NetError> for weaver_core::Error {
    fn from(err: NetError) -> Self {
        weaver_core::Error::NetworkResource(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_network_resource_error() {
        let err: weaver_core::Error = NetError::NameCollision("wvl00001a".into()).into();
        assert!(matches!(err, weaver_core::Error::NetworkResource(_)));
        assert_eq!(
            err.to_string(),
            "network resource error: host interface name 'wvl00001a' is already in use"
        );
    }

    #[test]
    fn command_error_display() {
        let err = NetError::Command {
            command: "ip link add name br0 type bridge".into(),
            status: "exit status: 2".into(),
            stderr: "RTNETLINK answers: File exists".into(),
        };
        assert_eq!(
            err.to_string(),
            "`ip link add name br0 type bridge` failed (exit status: 2): RTNETLINK answers: File exists"
        );
    }
}
