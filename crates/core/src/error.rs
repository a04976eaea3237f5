/// Errors surfaced by the cordon control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid capability profile: {0}")]
    InvalidProfile(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("argument outside the codec value space: {0}")]
    UnencodableArgument(String),

    #[error("no VM available within the acquisition deadline")]
    PoolExhausted,

    #[error("profile provisioning failed: {0}")]
    ProvisioningError(String),

    #[error("call exceeded its deadline")]
    Timeout,

    #[error("host-guest protocol violation: {0}")]
    ProtocolError(String),

    #[error("guest stream closed unexpectedly")]
    RemoteCrash,

    #[error("call cancelled by caller")]
    Cancelled,

    #[error("remote function raised {kind}: {message}")]
    RemoteException {
        kind: String,
        message: String,
        remote_trace: String,
    },

    #[error("manager is shutting down")]
    Shutdown,

    #[error("VM failed to boot: {0}")]
    BootFailure(String),

    #[error("runner does not support snapshots")]
    SnapshotUnsupported,

    #[error("snapshot restore failed: {0}")]
    RestoreFailure(String),

    #[error("hypervisor control endpoint unreachable: {0}")]
    ControlUnreachable(String),

    #[error("no suitable VM runner available")]
    NoRunnerAvailable,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error leaves the VM that produced it in an unknown
    /// state. Tainted VMs must not service further calls.
    pub fn taints_vm(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ProtocolError(_) | Error::RemoteCrash | Error::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
