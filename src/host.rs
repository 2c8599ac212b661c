//! Target host description handed to the execution layer.

use std::collections::BTreeMap;

use thiserror::Error;

/// Host parameter selecting the WinRM transport.
pub const WINRM_TRANSPORT_PARAMETER: &str = "winrm_transport";

/// Remote command protocol used to reach the host.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectionMethod {
    /// WS-Management (Windows Remote Management).
    #[default]
    WinRm,
    /// Secure shell via the system `ssh` client.
    Ssh,
}

/// WinRM transport requested through [`WINRM_TRANSPORT_PARAMETER`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WinRmTransportMode {
    /// HTTPS only.
    Ssl,
    /// Plain HTTP only.
    Http,
    /// Try HTTPS, fall back to HTTP when the connection is refused.
    #[default]
    Auto,
}

impl WinRmTransportMode {
    /// Interprets a parameter value; anything unrecognised means
    /// [`WinRmTransportMode::Auto`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssl" => Self::Ssl,
            "http" => Self::Http,
            _ => Self::Auto,
        }
    }
}

/// Execution target. Immutable for the lifetime of a session.
#[derive(Clone, Eq, PartialEq)]
pub struct HostConfiguration {
    /// Host name or IP address.
    pub address: String,
    /// Account used to log in.
    pub username: String,
    /// Password for WinRM basic authentication or SSH password prompts.
    pub password: Option<String>,
    /// Explicit port; protocol defaults apply when absent.
    pub port: Option<u16>,
    /// Remote command protocol.
    pub connection: ConnectionMethod,
    /// Private key passed to `ssh -i`.
    pub identity_file: Option<String>,
    /// Free-form protocol selection parameters.
    pub parameters: BTreeMap<String, String>,
}

impl HostConfiguration {
    /// Starts a builder for a [`HostConfiguration`].
    #[must_use]
    pub fn builder() -> HostConfigurationBuilder {
        HostConfigurationBuilder::default()
    }

    /// Looks up a protocol selection parameter.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// WinRM transport selected by the host parameters.
    #[must_use]
    pub fn winrm_transport(&self) -> WinRmTransportMode {
        self.parameter(WINRM_TRANSPORT_PARAMETER)
            .map_or(WinRmTransportMode::Auto, WinRmTransportMode::parse)
    }

    /// Ensures the address and username are present.
    ///
    /// # Errors
    ///
    /// Returns [`HostConfigError::Validation`] naming the empty field.
    pub fn validate(&self) -> Result<(), HostConfigError> {
        if self.address.is_empty() {
            return Err(HostConfigError::Validation("address".to_owned()));
        }
        if self.username.is_empty() {
            return Err(HostConfigError::Validation("username".to_owned()));
        }
        if self.port == Some(0) {
            return Err(HostConfigError::Validation("port".to_owned()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostConfiguration")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .field("connection", &self.connection)
            .field("identity_file", &self.identity_file)
            .field("parameters", &self.parameters)
            .finish()
    }
}

/// Builder for [`HostConfiguration`] that trims inputs and validates on
/// build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HostConfigurationBuilder {
    address: String,
    username: String,
    password: Option<String>,
    port: Option<u16>,
    connection: ConnectionMethod,
    identity_file: Option<String>,
    parameters: BTreeMap<String, String>,
}

impl HostConfigurationBuilder {
    /// Sets the host address.
    #[must_use]
    pub fn address(mut self, value: impl Into<String>) -> Self {
        self.address = value.into();
        self
    }

    /// Sets the login account.
    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = value.into();
        self
    }

    /// Sets the password.
    #[must_use]
    pub fn password(mut self, value: impl Into<String>) -> Self {
        self.password = Some(value.into());
        self
    }

    /// Overrides the protocol default port.
    #[must_use]
    pub const fn port(mut self, value: u16) -> Self {
        self.port = Some(value);
        self
    }

    /// Selects the remote command protocol.
    #[must_use]
    pub const fn connection(mut self, value: ConnectionMethod) -> Self {
        self.connection = value;
        self
    }

    /// Sets the SSH identity file.
    #[must_use]
    pub fn identity_file(mut self, value: impl Into<String>) -> Self {
        self.identity_file = Some(value.into());
        self
    }

    /// Adds one protocol selection parameter.
    #[must_use]
    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Builds and validates the [`HostConfiguration`].
    ///
    /// # Errors
    ///
    /// Returns [`HostConfigError::Validation`] when the address or username
    /// is empty, or the port is zero.
    pub fn build(self) -> Result<HostConfiguration, HostConfigError> {
        let host = HostConfiguration {
            address: self.address.trim().to_owned(),
            username: self.username.trim().to_owned(),
            password: self.password,
            port: self.port,
            connection: self.connection,
            identity_file: self
                .identity_file
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty()),
            parameters: self.parameters,
        };
        host.validate()?;
        Ok(host)
    }
}

/// Errors raised while describing a host.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum HostConfigError {
    /// Raised when a required field is missing or unusable.
    #[error("missing or invalid host field: {0}")]
    Validation(String),
}
