//! [`RemoteShell`] speaking WS-Management to the Windows `cmd` shell.
//!
//! Requests are SOAP envelopes posted to `/wsman` with HTTP basic
//! authentication. A shell is created with `Create`, commands are started
//! with `Command`, their streams are collected with `Receive` until the
//! command reports `Done`, and handles are released with `Signal` and
//! `Delete`.

use std::error::Error as StdError;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::escape::escape;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};
use uuid::Uuid;

use super::xml::{self, Element};
use super::{
    CommandId, Dialect, ExecutionConfig, RemoteCommandResult, RemoteShell, ShellFuture, ShellId,
    TransportError,
};
use crate::host::{HostConfiguration, WinRmTransportMode};

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE_SUFFIX: &str = "/CommandState/Done";
/// WSManFault code for an expired `OperationTimeout`.
const OPERATION_TIMEOUT_FAULT: &str = "2150858793";
const MAX_ENVELOPE_SIZE: u32 = 153_600;
/// Extra time granted to the HTTP client beyond the WS-Man timeout.
const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);
const PROBE_COMMAND: &str = "@echo connected";

/// Address of a WS-Man listener.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WinRmEndpoint {
    url: String,
    https: bool,
}

impl WinRmEndpoint {
    /// HTTPS listener on `address:port`.
    #[must_use]
    pub fn https(address: &str, port: u16) -> Self {
        Self {
            url: format!("https://{}:{port}/wsman", bracket_ipv6(address)),
            https: true,
        }
    }

    /// Plain HTTP listener on `address:port`.
    #[must_use]
    pub fn http(address: &str, port: u16) -> Self {
        Self {
            url: format!("http://{}:{port}/wsman", bracket_ipv6(address)),
            https: false,
        }
    }

    /// Full `/wsman` URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the listener uses TLS.
    #[must_use]
    pub const fn is_https(&self) -> bool {
        self.https
    }
}

fn bracket_ipv6(address: &str) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]")
    } else {
        address.to_owned()
    }
}

/// WS-Man client bound to one endpoint and account.
pub struct WinRmShell {
    client: reqwest::Client,
    endpoint: WinRmEndpoint,
    username: String,
    password: String,
    operation_timeout: Duration,
}

impl std::fmt::Debug for WinRmShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmShell")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl WinRmShell {
    /// Creates a client for `endpoint`. Certificate validation is disabled
    /// for HTTPS endpoints, which typically carry self-signed certificates.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] when the HTTP client cannot be
    /// built.
    pub fn new(
        endpoint: WinRmEndpoint,
        host: &HostConfiguration,
        config: &ExecutionConfig,
    ) -> Result<Self, TransportError> {
        let operation_timeout = config.winrm_operation_timeout();
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(endpoint.is_https())
            .timeout(operation_timeout + HTTP_TIMEOUT_MARGIN)
            .build()
            .map_err(|err| TransportError::other(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            username: host.username.clone(),
            password: host.password.clone().unwrap_or_default(),
            operation_timeout,
        })
    }

    /// Picks the endpoint requested by the host's `winrm_transport`
    /// parameter. In automatic mode HTTPS is probed with `@echo connected`
    /// and HTTP is used when the HTTPS listener cannot be reached.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] when the HTTP client cannot be
    /// built.
    pub async fn negotiate(
        host: &HostConfiguration,
        config: &ExecutionConfig,
    ) -> Result<Self, TransportError> {
        let https_port = host.port.unwrap_or(config.winrm_https_port);
        let http_port = host.port.unwrap_or(config.winrm_http_port);
        match host.winrm_transport() {
            WinRmTransportMode::Ssl => {
                info!(host = host.address.as_str(), "SSL only WinRM session");
                Self::new(WinRmEndpoint::https(&host.address, https_port), host, config)
            }
            WinRmTransportMode::Http => {
                info!(host = host.address.as_str(), "HTTP only WinRM session");
                Self::new(WinRmEndpoint::http(&host.address, http_port), host, config)
            }
            WinRmTransportMode::Auto => {
                info!(host = host.address.as_str(), "identifying whether host is SSL or HTTP");
                let secure =
                    Self::new(WinRmEndpoint::https(&host.address, https_port), host, config)?;
                let probe = secure.run_cmd(PROBE_COMMAND).await;
                match probe {
                    Err(TransportError::Connect { .. } | TransportError::Timeout { .. }) => {
                        info!(host = host.address.as_str(), "falling back to HTTP");
                        Self::new(WinRmEndpoint::http(&host.address, http_port), host, config)
                    }
                    _ => {
                        info!(host = host.address.as_str(), "connecting via SSL");
                        Ok(secure)
                    }
                }
            }
        }
    }

    /// Endpoint this client talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &WinRmEndpoint {
        &self.endpoint
    }

    /// Runs `command` in a fresh shell and releases both handles.
    ///
    /// # Errors
    ///
    /// Returns the first [`TransportError`] raised by the exchange.
    pub async fn run_cmd(&self, command: &str) -> Result<RemoteCommandResult, TransportError> {
        let shell = self.create_shell().await?;
        let outcome = self.run_in_shell(&shell, command).await;
        let closed = self.delete_shell(&shell).await;
        let result = outcome?;
        closed?;
        Ok(result)
    }

    async fn run_in_shell(
        &self,
        shell: &ShellId,
        command: &str,
    ) -> Result<RemoteCommandResult, TransportError> {
        let command_id = self.start_command(shell, command).await?;
        let outcome = self.receive(shell, &command_id).await;
        let signalled = self.terminate(shell, &command_id).await;
        let result = outcome?;
        signalled?;
        Ok(result)
    }

    async fn create_shell(&self) -> Result<ShellId, TransportError> {
        let options = concat!(
            "<wsman:OptionSet>",
            "<wsman:Option Name=\"WINRS_NOPROFILE\">FALSE</wsman:Option>",
            "<wsman:Option Name=\"WINRS_CODEPAGE\">65001</wsman:Option>",
            "</wsman:OptionSet>"
        );
        let body = concat!(
            "<rsp:Shell>",
            "<rsp:InputStreams>stdin</rsp:InputStreams>",
            "<rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
            "</rsp:Shell>"
        );
        let reply = self
            .call(self.envelope(ACTION_CREATE, None, options, body))
            .await?;
        let id = reply
            .iter()
            .find(|element| element.attribute("Name") == Some("ShellId"))
            .map(|element| element.text.trim())
            .or_else(|| xml::first_text(&reply, "ShellId"))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| self.malformed("Create reply carries no ShellId"))?;
        debug!(endpoint = self.endpoint.url(), shell = id, "opened WinRM shell");
        Ok(ShellId::new(id))
    }

    async fn start_command(
        &self,
        shell: &ShellId,
        command: &str,
    ) -> Result<CommandId, TransportError> {
        let options = concat!(
            "<wsman:OptionSet>",
            "<wsman:Option Name=\"WINRS_CONSOLEMODE_STDIN\">TRUE</wsman:Option>",
            "<wsman:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</wsman:Option>",
            "</wsman:OptionSet>"
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command)
        );
        let reply = self
            .call(self.envelope(ACTION_COMMAND, Some(shell), options, &body))
            .await?;
        let id = xml::first_text(&reply, "CommandId")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| self.malformed("Command reply carries no CommandId"))?;
        Ok(CommandId::new(id))
    }

    async fn receive(
        &self,
        shell: &ShellId,
        command: &CommandId,
    ) -> Result<RemoteCommandResult, TransportError> {
        let body = format!(
            "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
            escape(command.as_str())
        );
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell), "", &body);
            let (status, text) = self.post(envelope).await?;
            if status == StatusCode::INTERNAL_SERVER_ERROR && text.contains(OPERATION_TIMEOUT_FAULT)
            {
                debug!(command_id = %command, "WinRM receive timed out; polling again");
                continue;
            }
            let reply = self.check(status, &text)?;
            for stream in reply.iter().filter(|element| element.name == "Stream") {
                let bytes = STANDARD
                    .decode(stream.text.trim())
                    .map_err(|err| self.malformed(&format!("stream is not base64: {err}")))?;
                match stream.attribute("Name") {
                    Some("stderr") => stderr.extend_from_slice(&bytes),
                    _ => stdout.extend_from_slice(&bytes),
                }
            }
            let done = reply.iter().any(|element| {
                element.name == "CommandState"
                    && element
                        .attribute("State")
                        .is_some_and(|state| state.ends_with(STATE_DONE_SUFFIX))
            });
            if done {
                let exit_code = xml::first_text(&reply, "ExitCode")
                    .ok_or_else(|| self.malformed("Done reply carries no ExitCode"))
                    .and_then(|code| {
                        parse_exit_code(code).ok_or_else(|| {
                            self.malformed(&format!("ExitCode {code:?} is not an exit status"))
                        })
                    })?;
                return Ok(RemoteCommandResult {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
        }
    }

    async fn terminate(&self, shell: &ShellId, command: &CommandId) -> Result<(), TransportError> {
        let body = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>",
            escape(command.as_str())
        );
        self.call(self.envelope(ACTION_SIGNAL, Some(shell), "", &body))
            .await
            .map(drop)
    }

    async fn delete_shell(&self, shell: &ShellId) -> Result<(), TransportError> {
        self.call(self.envelope(ACTION_DELETE, Some(shell), "", ""))
            .await?;
        debug!(endpoint = self.endpoint.url(), shell = %shell, "closed WinRM shell");
        Ok(())
    }

    fn envelope(
        &self,
        action: &str,
        shell: Option<&ShellId>,
        options: &str,
        body: &str,
    ) -> String {
        let mut header = format!(
            "<wsa:To>{to}</wsa:To>\
             <wsa:ReplyTo><wsa:Address s:mustUnderstand=\"true\">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</wsa:Address></wsa:ReplyTo>\
             <wsman:MaxEnvelopeSize s:mustUnderstand=\"true\">{MAX_ENVELOPE_SIZE}</wsman:MaxEnvelopeSize>\
             <wsa:MessageID>uuid:{id}</wsa:MessageID>\
             <wsman:Locale xml:lang=\"en-US\" s:mustUnderstand=\"false\"/>\
             <wsman:OperationTimeout>PT{timeout}S</wsman:OperationTimeout>\
             <wsa:Action s:mustUnderstand=\"true\">{action}</wsa:Action>\
             <wsman:ResourceURI s:mustUnderstand=\"true\">{RESOURCE_URI}</wsman:ResourceURI>",
            to = escape(self.endpoint.url()),
            id = Uuid::new_v4().to_string().to_uppercase(),
            timeout = self.operation_timeout.as_secs(),
        );
        if let Some(id) = shell {
            header.push_str(&format!(
                "<wsman:SelectorSet><wsman:Selector Name=\"ShellId\">{}</wsman:Selector></wsman:SelectorSet>",
                escape(id.as_str())
            ));
        }
        header.push_str(options);
        format!(
            "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\" \
             xmlns:wsa=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\" \
             xmlns:wsman=\"http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd\" \
             xmlns:rsp=\"http://schemas.microsoft.com/wbem/wsman/1/windows/shell\">\
             <s:Header>{header}</s:Header><s:Body>{body}</s:Body></s:Envelope>"
        )
    }

    async fn call(&self, envelope: String) -> Result<Vec<Element>, TransportError> {
        let (status, text) = self.post(envelope).await?;
        self.check(status, &text)
    }

    async fn post(&self, envelope: String) -> Result<(StatusCode, String), TransportError> {
        let response = self
            .client
            .post(self.endpoint.url())
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
            .body(envelope)
            .send()
            .await
            .map_err(|err| self.request_error(&err))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| self.request_error(&err))?;
        Ok((status, text))
    }

    fn check(&self, status: StatusCode, text: &str) -> Result<Vec<Element>, TransportError> {
        if status != StatusCode::OK {
            let fault = xml::elements(text)
                .ok()
                .and_then(|reply| {
                    xml::first_text(&reply, "Message")
                        .or_else(|| xml::first_text(&reply, "Text"))
                        .map(str::to_owned)
                })
                .unwrap_or_default();
            return Err(TransportError::Protocol {
                endpoint: self.endpoint.url().to_owned(),
                message: format!(
                    "Bad HTTP response returned from server. Code {} {fault}",
                    status.as_u16()
                )
                .trim_end()
                .to_owned(),
            });
        }
        xml::elements(text).map_err(|err| self.malformed(&err.to_string()))
    }

    fn request_error(&self, err: &reqwest::Error) -> TransportError {
        let endpoint = self.endpoint.url().to_owned();
        let message = error_chain(err);
        if err.is_timeout() {
            TransportError::Timeout { endpoint, message }
        } else if err.is_connect() {
            TransportError::Connect { endpoint, message }
        } else {
            TransportError::Other { message }
        }
    }

    fn malformed(&self, detail: &str) -> TransportError {
        TransportError::Protocol {
            endpoint: self.endpoint.url().to_owned(),
            message: format!("malformed WS-Man reply: {detail}"),
        }
    }
}

/// Parses a WS-Man `ExitCode`.
///
/// Windows reports exit statuses as unsigned DWORDs, so values above
/// `i32::MAX` are folded into their signed two's-complement form
/// (`4294967295` becomes `-1`).
fn parse_exit_code(text: &str) -> Option<i32> {
    let value: i64 = text.trim().parse().ok()?;
    i32::try_from(value).ok().or_else(|| {
        let dword = u32::try_from(value).ok()?;
        i32::try_from(i64::from(dword) - (1_i64 << 32)).ok()
    })
}

/// Renders an error with its sources so OS error numbers stay visible.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

impl RemoteShell for WinRmShell {
    fn dialect(&self) -> Dialect {
        Dialect::PowerShell
    }

    fn open_shell(&self) -> ShellFuture<'_, ShellId> {
        Box::pin(self.create_shell())
    }

    fn run_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a str,
    ) -> ShellFuture<'a, CommandId> {
        Box::pin(self.start_command(shell, command))
    }

    fn command_output<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, RemoteCommandResult> {
        Box::pin(self.receive(shell, command))
    }

    fn cleanup_command<'a>(
        &'a self,
        shell: &'a ShellId,
        command: &'a CommandId,
    ) -> ShellFuture<'a, ()> {
        Box::pin(self.terminate(shell, command))
    }

    fn close_shell<'a>(&'a self, shell: &'a ShellId) -> ShellFuture<'a, ()> {
        Box::pin(self.delete_shell(shell))
    }
}
