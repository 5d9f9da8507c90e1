//! WS-Management SOAP envelopes for the `cmd` shell and their responses.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use uuid::Uuid;

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const CMD_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// WSManFault code for a Receive that timed out with no output yet
const OPERATION_TIMEOUT_CODE: &str = "2150858793";

pub const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";

/// Envelope limits shared by every request.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    pub url: String,
    pub max_envelope_size: u32,
    /// WS-Management operation timeout in seconds
    pub operation_timeout: u64,
}

impl EnvelopeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_envelope_size: 153_600,
            operation_timeout: 60,
        }
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                    xml_escape(id)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{url}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{CMD_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout}S</w:OperationTimeout>
    {selector}{options}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            url = xml_escape(&self.url),
            message_id = Uuid::new_v4(),
            max = self.max_envelope_size,
            timeout = self.operation_timeout,
        )
    }

    pub fn create_shell(&self) -> String {
        self.envelope(
            ACTION_CREATE,
            None,
            r#"<w:OptionSet><w:Option Name="WINRS_NOPROFILE">FALSE</w:Option><w:Option Name="WINRS_CODEPAGE">65001</w:Option></w:OptionSet>"#,
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        )
    }

    pub fn command(&self, shell_id: &str, command_line: &str) -> String {
        self.envelope(
            ACTION_COMMAND,
            Some(shell_id),
            r#"<w:OptionSet><w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option><w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option></w:OptionSet>"#,
            &format!(
                "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
                xml_escape(command_line)
            ),
        )
    }

    pub fn receive(&self, shell_id: &str, command_id: &str) -> String {
        self.envelope(
            ACTION_RECEIVE,
            Some(shell_id),
            "",
            &format!(
                "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
                xml_escape(command_id)
            ),
        )
    }

    pub fn signal_terminate(&self, shell_id: &str, command_id: &str) -> String {
        self.envelope(
            ACTION_SIGNAL,
            Some(shell_id),
            "",
            &format!(
                "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
                xml_escape(command_id),
                SIGNAL_TERMINATE
            ),
        )
    }

    pub fn delete_shell(&self, shell_id: &str) -> String {
        self.envelope(ACTION_DELETE, Some(shell_id), "", "")
    }
}

/// One Receive response.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set once the command state is `Done`
    pub exit_code: Option<i32>,
}

pub fn parse_shell_id(xml: &str) -> Option<String> {
    if let Some((_, id)) = elements(xml, "ShellId").into_iter().next() {
        return Some(id.trim().to_string());
    }
    elements(xml, "Selector")
        .into_iter()
        .find(|(attrs, _)| attribute(attrs, "Name") == Some("ShellId"))
        .map(|(_, id)| id.trim().to_string())
}

pub fn parse_command_id(xml: &str) -> Option<String> {
    elements(xml, "CommandId")
        .into_iter()
        .next()
        .map(|(_, id)| id.trim().to_string())
}

pub fn parse_receive(xml: &str) -> Result<ReceiveOutput, String> {
    let mut output = ReceiveOutput::default();

    for (attrs, content) in elements(xml, "Stream") {
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let decoded = BASE64_STANDARD
            .decode(content)
            .map_err(|e| format!("invalid stream payload: {}", e))?;
        match attribute(attrs, "Name") {
            Some("stderr") => output.stderr.extend_from_slice(&decoded),
            _ => output.stdout.extend_from_slice(&decoded),
        }
    }

    for (attrs, content) in elements(xml, "CommandState") {
        if attribute(attrs, "State").is_some_and(|s| s.ends_with("/Done")) {
            let code = elements(content, "ExitCode")
                .into_iter()
                .next()
                .map(|(_, code)| code.trim().to_string())
                .unwrap_or_else(|| "0".to_string());
            let code = code
                .parse::<i64>()
                .map_err(|e| format!("invalid exit code [{}]: {}", code, e))?;
            // Windows exit codes are DWORDs
            output.exit_code = Some(code as i32);
        }
    }

    Ok(output)
}

pub fn is_operation_timeout(xml: &str) -> bool {
    xml.contains(OPERATION_TIMEOUT_CODE) || xml.contains("w:TimedOut")
}

/// Human readable reason of a SOAP fault.
pub fn fault_reason(xml: &str) -> String {
    for name in ["Message", "Text"] {
        if let Some((_, text)) = elements(xml, name).into_iter().find(|(_, t)| !t.trim().is_empty()) {
            return xml_unescape(text.trim());
        }
    }
    "unknown fault".to_string()
}

/// `(attributes, content)` of every element with the given local name,
/// whatever its namespace prefix. Nested elements of the same name are not
/// supported.
fn elements<'a>(xml: &'a str, local_name: &str) -> Vec<(&'a str, &'a str)> {
    let mut found = Vec::new();
    let mut rest = xml;

    while let Some(lt) = rest.find('<') {
        let after = &rest[lt + 1..];
        let name_end = after
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(after.len());
        let tag = &after[..name_end];
        let local = tag.rsplit(':').next().unwrap_or(tag);

        if local != local_name || tag.starts_with('/') {
            rest = after;
            continue;
        }

        let Some(gt) = after.find('>') else { break };
        let head = &after[name_end..gt];
        if let Some(attrs) = head.strip_suffix('/') {
            found.push((attrs.trim(), ""));
            rest = &after[gt + 1..];
            continue;
        }

        let body = &after[gt + 1..];
        let close = format!("</{}>", tag);
        let Some(end) = body.find(&close) else { break };
        found.push((head.trim(), &body[..end]));
        rest = &body[end + close.len()..];
    }

    found
}

fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", name);
    let mut search = attrs;
    while let Some(pos) = search.find(&needle) {
        let boundary_ok = pos == 0 || search[..pos].ends_with(char::is_whitespace);
        let value = &search[pos + needle.len()..];
        if boundary_ok {
            return value.find('"').map(|end| &value[..end]);
        }
        search = value;
    }
    None
}

pub fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_shell_id_from_body_or_selector() {
        let body = r#"<s:Body><rsp:Shell><rsp:ShellId>ABC-123</rsp:ShellId></rsp:Shell></s:Body>"#;
        assert_eq!(parse_shell_id(body).as_deref(), Some("ABC-123"));

        let selector = r#"<w:SelectorSet><w:Selector Name="ShellId">XYZ</w:Selector></w:SelectorSet>"#;
        assert_eq!(parse_shell_id(selector).as_deref(), Some("XYZ"));

        assert_eq!(parse_shell_id("<s:Body/>"), None);
    }

    #[test]
    fn test_parse_command_id() {
        let body = r#"<rsp:CommandResponse><rsp:CommandId>9F1E</rsp:CommandId></rsp:CommandResponse>"#;
        assert_eq!(parse_command_id(body).as_deref(), Some("9F1E"));
    }

    #[test]
    fn test_parse_receive_streams_and_exit() {
        let xml = format!(
            r#"<rsp:ReceiveResponse>
<rsp:Stream Name="stdout" CommandId="1">{}</rsp:Stream>
<rsp:Stream Name="stderr" CommandId="1">{}</rsp:Stream>
<rsp:Stream Name="stdout" CommandId="1" End="true"></rsp:Stream>
<rsp:CommandState CommandId="1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>
</rsp:ReceiveResponse>"#,
            BASE64_STANDARD.encode("hello"),
            BASE64_STANDARD.encode("oops"),
        );
        let out = parse_receive(&xml).unwrap();
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr, b"oops");
        assert_eq!(out.exit_code, Some(3));
    }

    #[test]
    fn test_parse_receive_running() {
        let xml = r#"<rsp:CommandState CommandId="1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/>"#;
        let out = parse_receive(xml).unwrap();
        assert_eq!(out.exit_code, None);
    }

    #[test]
    fn test_fault_helpers() {
        let fault = r#"<s:Fault><s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>w:TimedOut</s:Value></s:Subcode></s:Code>
<s:Reason><s:Text xml:lang="en-US">The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</s:Text></s:Reason>
<s:Detail><f:WSManFault xmlns:f="http://schemas.microsoft.com/wbem/wsman/1/wsmanfault" Code="2150858793"/></s:Detail></s:Fault>"#;
        assert!(is_operation_timeout(fault));
        assert!(fault_reason(fault).contains("OperationTimeout"));
        assert!(!is_operation_timeout("<s:Fault><s:Text>Access is denied.</s:Text></s:Fault>"));
    }

    #[test]
    fn test_command_envelope_escapes_command_line() {
        let config = EnvelopeConfig::new("https://host:5986/wsman");
        let envelope = config.command("shell-1", "echo \"a & b\" > c");
        assert!(envelope.contains("echo &quot;a &amp; b&quot; &gt; c"));
        assert!(envelope.contains(r#"<w:Selector Name="ShellId">shell-1</w:Selector>"#));
        assert!(envelope.contains(ACTION_COMMAND));
    }

    #[test]
    fn test_attribute_matches_whole_name() {
        assert_eq!(attribute(r#"CommandId="1" Name="stderr""#, "Name"), Some("stderr"));
        assert_eq!(attribute(r#"XName="a""#, "Name"), None);
    }
}
