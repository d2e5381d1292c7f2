//! Minimal XML-RPC codec and HTTP transport.
//!
//! All three remote services we talk to (the control plane, the IP-management
//! service and the cluster management API) speak XML-RPC over HTTP(S).

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Double(f64),
    Str(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
    Nil,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Struct member lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Struct(members) => members.get(key),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// `<fault>` returned by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub code: i64,
    pub message: String,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XML-RPC fault {}: {}", self.code, self.message)
    }
}

impl std::error::Error for Fault {}

// --- Encoding ---

pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Int(i) if i32::try_from(*i).is_ok() => {
            out.push_str("<int>");
            out.push_str(&i.to_string());
            out.push_str("</int>");
        }
        Value::Int(i) => {
            out.push_str("<i8>");
            out.push_str(&i.to_string());
            out.push_str("</i8>");
        }
        Value::Bool(b) => out.push_str(if *b { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" }),
        Value::Double(d) => {
            out.push_str("<double>");
            out.push_str(&d.to_string());
            out.push_str("</double>");
        }
        Value::Str(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                encode_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
        Value::Nil => out.push_str("<nil/>"),
    }
    out.push_str("</value>");
}

// --- Decoding ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open(String),
    Close(String),
    Text(String),
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn tokenize(xml: &str) -> Result<VecDeque<Token>> {
    // Text is kept verbatim; whitespace between tags is dropped by the parser.
    let mut reader = Reader::from_str(xml);

    let mut tokens = VecDeque::new();
    loop {
        let token = match reader.read_event().context("malformed XML")? {
            Event::Start(e) => Token::Open(tag_name(e.name().as_ref())),
            Event::End(e) => Token::Close(tag_name(e.name().as_ref())),
            Event::Empty(e) => {
                let name = tag_name(e.name().as_ref());
                tokens.push_back(Token::Open(name.clone()));
                Token::Close(name)
            }
            Event::Text(t) => Token::Text(t.unescape().context("bad XML text")?.into_owned()),
            Event::CData(t) => Token::Text(String::from_utf8_lossy(&t.into_inner()).into_owned()),
            Event::Eof => break,
            _ => continue,
        };
        // Text and CDATA sections may be split; keep them as one token.
        if let (Token::Text(more), Some(Token::Text(prev))) = (&token, tokens.back_mut()) {
            prev.push_str(more);
            continue;
        }
        tokens.push_back(token);
    }
    Ok(tokens)
}

struct Parser {
    tokens: VecDeque<Token>,
}

fn is_blank(token: Option<&Token>) -> bool {
    matches!(token, Some(Token::Text(s)) if s.trim().is_empty())
}

impl Parser {
    fn skip_blank(&mut self) {
        while is_blank(self.tokens.front()) {
            self.tokens.pop_front();
        }
    }

    fn next_raw(&mut self) -> Result<Token> {
        self.tokens
            .pop_front()
            .ok_or_else(|| anyhow!("unexpected end of XML-RPC document"))
    }

    /// Next structural token, skipping indentation.
    fn next(&mut self) -> Result<Token> {
        self.skip_blank();
        self.next_raw()
    }

    fn peek_open(&mut self, name: &str) -> bool {
        self.skip_blank();
        matches!(self.tokens.front(), Some(Token::Open(n)) if n == name)
    }

    fn at_close(&self, name: &str) -> bool {
        matches!(self.tokens.front(), Some(Token::Close(n)) if n == name)
    }

    fn expect_open(&mut self, name: &str) -> Result<()> {
        match self.next()? {
            Token::Open(n) if n == name => Ok(()),
            other => bail!("expected <{}>, found {:?}", name, other),
        }
    }

    fn expect_close(&mut self, name: &str) -> Result<()> {
        match self.next()? {
            Token::Close(n) if n == name => Ok(()),
            other => bail!("expected </{}>, found {:?}", name, other),
        }
    }

    /// Text content up to and including `</name>`; empty elements yield "".
    fn text_until_close(&mut self, name: &str) -> Result<String> {
        match self.next_raw()? {
            Token::Text(s) => {
                self.expect_close(name)?;
                Ok(s)
            }
            Token::Close(n) if n == name => Ok(String::new()),
            other => bail!("expected text in <{}>, found {:?}", name, other),
        }
    }

    fn value(&mut self) -> Result<Value> {
        self.expect_open("value")?;
        let tag = match self.next_raw()? {
            // Untyped values are strings.
            Token::Text(s) if self.at_close("value") => {
                self.expect_close("value")?;
                return Ok(Value::Str(s));
            }
            Token::Text(s) if s.trim().is_empty() => match self.next()? {
                Token::Open(tag) => tag,
                other => bail!("unexpected {:?} in <value>", other),
            },
            Token::Close(n) if n == "value" => return Ok(Value::Str(String::new())),
            Token::Open(tag) => tag,
            other => bail!("unexpected {:?} in <value>", other),
        };

        let value = match tag.as_str() {
            "int" | "i4" | "i8" => {
                let raw = self.text_until_close(&tag)?;
                Value::Int(raw.trim().parse().with_context(|| format!("bad <{}> {:?}", tag, raw))?)
            }
            "boolean" => match self.text_until_close(&tag)?.trim() {
                "1" | "true" => Value::Bool(true),
                "0" | "false" => Value::Bool(false),
                other => bail!("bad <boolean> {:?}", other),
            },
            "double" => {
                let raw = self.text_until_close(&tag)?;
                Value::Double(raw.trim().parse().with_context(|| format!("bad <double> {:?}", raw))?)
            }
            "string" | "dateTime.iso8601" | "base64" => Value::Str(self.text_until_close(&tag)?),
            "nil" => {
                self.expect_close("nil")?;
                Value::Nil
            }
            "array" => {
                self.expect_open("data")?;
                let mut items = Vec::new();
                while self.peek_open("value") {
                    items.push(self.value()?);
                }
                self.expect_close("data")?;
                self.expect_close("array")?;
                Value::Array(items)
            }
            "struct" => {
                let mut members = BTreeMap::new();
                while self.peek_open("member") {
                    self.expect_open("member")?;
                    self.expect_open("name")?;
                    let name = self.text_until_close("name")?;
                    let member = self.value()?;
                    self.expect_close("member")?;
                    members.insert(name, member);
                }
                self.expect_close("struct")?;
                Value::Struct(members)
            }
            other => bail!("unsupported XML-RPC type <{}>", other),
        };
        self.expect_close("value")?;
        Ok(value)
    }
}

/// Decode a `<methodResponse>`. A `<fault>` becomes an `Err` wrapping [`Fault`].
pub fn decode_response(xml: &str) -> Result<Value> {
    let mut parser = Parser {
        tokens: tokenize(xml)?,
    };
    parser.expect_open("methodResponse")?;
    match parser.next()? {
        Token::Open(t) if t == "params" => {
            parser.expect_open("param")?;
            let value = parser.value()?;
            parser.expect_close("param")?;
            parser.expect_close("params")?;
            Ok(value)
        }
        Token::Open(t) if t == "fault" => {
            let fault = parser.value()?;
            Err(Fault {
                code: fault.get("faultCode").and_then(Value::as_i64).unwrap_or(0),
                message: fault
                    .get("faultString")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            }
            .into())
        }
        other => bail!("unexpected {:?} in <methodResponse>", other),
    }
}

// --- Transport ---

#[derive(Clone)]
pub struct XmlRpcClient {
    client: Client,
    endpoint: String,
    basic_auth: Option<(String, String)>,
}

impl XmlRpcClient {
    pub fn new(endpoint: &str, timeout: Duration, accept_invalid_certs: bool) -> Result<Self> {
        // Default reqwest client has no overall timeout; a stalled endpoint would hang the caller.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim().to_string(),
            basic_auth: None,
        })
    }

    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    pub async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        tracing::debug!("🔵 [xmlrpc] POST {} - {}", self.endpoint, method);

        let mut request = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(encode_call(method, params));
        if let Some((user, password)) = &self.basic_auth {
            request = request.basic_auth(user, Some(password));
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("{} {}", method, self.endpoint))?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("{} failed: status={} body={}", method, status.as_u16(), text);
        }
        decode_response(&text).with_context(|| method.to_string())
    }
}
