//! XML-RPC encoding.
//!
//! CCU and Homegear speak XML-RPC in both directions: the bridge posts
//! `methodCall` documents to the controller and the controller posts
//! `methodCall` documents (`event`, `newDevices`, `system.multicall`, ...)
//! to the callback server. Values map onto [`RpcValue`]:
//!
//! | XML-RPC | JSON |
//! |---------|------|
//! | `i4`, `int`, `i8` | integer |
//! | `double` | float |
//! | `boolean` | bool |
//! | `string`, untyped, `dateTime.iso8601`, `base64` | string |
//! | `nil` | null |
//! | `array` | array |
//! | `struct` | object |

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use thiserror::Error;

use hmbridge_common::{RpcStruct, RpcValue, value_as_i64, value_as_str};

use crate::error::RpcError;

/// Content type of XML-RPC bodies.
pub const CONTENT_TYPE: &str = "text/xml";

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Errors while decoding an XML-RPC document.
#[derive(Error, Debug)]
pub enum XmlRpcError {
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Malformed XML-RPC document: {0}")]
    Malformed(String),
}

impl XmlRpcError {
    fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Encode a `methodCall` document.
pub fn encode_call(method: &str, params: &[RpcValue]) -> String {
    let mut out = String::from(XML_DECL);
    out.push_str("<methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

/// Encode a successful `methodResponse`.
pub fn encode_response(value: &RpcValue) -> String {
    let mut out = String::from(XML_DECL);
    out.push_str("<methodResponse><params><param>");
    write_value(&mut out, value);
    out.push_str("</param></params></methodResponse>");
    out
}

/// Encode a fault `methodResponse`.
pub fn encode_fault(code: i64, message: &str) -> String {
    let mut fault = RpcStruct::new();
    fault.insert("faultCode".to_string(), RpcValue::from(code));
    fault.insert("faultString".to_string(), RpcValue::from(message));

    let mut out = String::from(XML_DECL);
    out.push_str("<methodResponse><fault>");
    write_value(&mut out, &RpcValue::Object(fault));
    out.push_str("</fault></methodResponse>");
    out
}

/// Encode the outcome of a call as a `methodResponse`.
pub fn encode_result(result: &Result<RpcValue, RpcError>) -> String {
    match result {
        Ok(value) => encode_response(value),
        Err(RpcError::Fault { code, message }) => encode_fault(*code, message),
        Err(other) => encode_fault(-32000, &other.to_string()),
    }
}

fn write_value(out: &mut String, value: &RpcValue) {
    out.push_str("<value>");
    match value {
        RpcValue::Null => out.push_str("<nil/>"),
        RpcValue::Bool(b) => {
            out.push_str(if *b { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" })
        }
        RpcValue::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => {
                out.push_str(&format!("<i4>{i}</i4>"));
            }
            Some(i) => out.push_str(&format!("<i8>{i}</i8>")),
            None => {
                let f = n.as_f64().unwrap_or_default();
                out.push_str(&format!("<double>{f}</double>"));
            }
        },
        RpcValue::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s.as_str()));
            out.push_str("</string>");
        }
        RpcValue::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        RpcValue::Object(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                out.push_str(&escape(name.as_str()));
                out.push_str("</name>");
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// Decode a `methodCall` document into method name and parameters.
pub fn decode_call(xml: &str) -> Result<(String, Vec<RpcValue>), XmlRpcError> {
    let mut parser = Parser::new(xml)?;

    parser.open("methodCall")?;
    parser.open("methodName")?;
    let method = parser.text_until_close("methodName")?.trim().to_string();
    if method.is_empty() {
        return Err(XmlRpcError::malformed("empty methodName"));
    }

    let mut params = Vec::new();
    if parser.at_open("params") {
        parser.open("params")?;
        while parser.at_open("param") {
            parser.open("param")?;
            params.push(parser.value()?);
            parser.close("param")?;
        }
        parser.close("params")?;
    }
    parser.close("methodCall")?;

    Ok((method, params))
}

/// Decode a `methodResponse` document. Faults become [`RpcError::Fault`].
pub fn decode_response(xml: &str) -> Result<RpcValue, RpcError> {
    let response = parse_response(xml).map_err(|e| RpcError::InvalidResponse(e.to_string()))?;
    match response {
        Response::Value(value) => Ok(value),
        Response::Fault(fault) => {
            let code = fault.get("faultCode").and_then(value_as_i64).unwrap_or(-1);
            let message = fault
                .get("faultString")
                .and_then(value_as_str)
                .unwrap_or_default();
            Err(RpcError::fault(code, message))
        }
    }
}

enum Response {
    Value(RpcValue),
    Fault(RpcValue),
}

fn parse_response(xml: &str) -> Result<Response, XmlRpcError> {
    let mut parser = Parser::new(xml)?;
    parser.open("methodResponse")?;

    let response = if parser.at_open("fault") {
        parser.open("fault")?;
        let fault = parser.value()?;
        parser.close("fault")?;
        Response::Fault(fault)
    } else {
        parser.open("params")?;
        // `<params/>` answers a void call
        let value = if parser.at_open("param") {
            parser.open("param")?;
            let value = parser.value()?;
            parser.close("param")?;
            value
        } else {
            RpcValue::Null
        };
        parser.close("params")?;
        Response::Value(value)
    };

    parser.close("methodResponse")?;
    Ok(response)
}

#[derive(Debug, PartialEq)]
enum Token {
    Open(String),
    Close(String),
    Text(String),
}

/// Recursive descent over a flattened event stream.
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(xml: &str) -> Result<Self, XmlRpcError> {
        Ok(Self {
            tokens: tokenize(xml)?,
            pos: 0,
        })
    }

    fn skip_whitespace(&mut self) {
        while let Some(Token::Text(text)) = self.tokens.get(self.pos) {
            if !text.trim().is_empty() {
                break;
            }
            self.pos += 1;
        }
    }

    fn at_open(&mut self, name: &str) -> bool {
        self.skip_whitespace();
        matches!(self.tokens.get(self.pos), Some(Token::Open(n)) if n == name)
    }

    fn open(&mut self, name: &str) -> Result<(), XmlRpcError> {
        if !self.at_open(name) {
            return Err(self.unexpected(&format!("<{name}>")));
        }
        self.pos += 1;
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<(), XmlRpcError> {
        self.skip_whitespace();
        match self.tokens.get(self.pos) {
            Some(Token::Close(n)) if n == name => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(self.unexpected(&format!("</{name}>"))),
        }
    }

    /// Text content (possibly empty) followed by the closing tag.
    fn text_until_close(&mut self, name: &str) -> Result<String, XmlRpcError> {
        let text = match self.tokens.get(self.pos) {
            Some(Token::Text(text)) => {
                let text = text.clone();
                self.pos += 1;
                text
            }
            _ => String::new(),
        };
        self.close(name)?;
        Ok(text)
    }

    fn unexpected(&self, expected: &str) -> XmlRpcError {
        let found = match self.tokens.get(self.pos) {
            Some(Token::Open(n)) => format!("<{n}>"),
            Some(Token::Close(n)) => format!("</{n}>"),
            Some(Token::Text(t)) => format!("text {t:?}"),
            None => "end of document".to_string(),
        };
        XmlRpcError::malformed(format!("expected {expected}, found {found}"))
    }

    fn value(&mut self) -> Result<RpcValue, XmlRpcError> {
        self.open("value")?;

        // A value without a type element is a string
        match (self.tokens.get(self.pos), self.tokens.get(self.pos + 1)) {
            (Some(Token::Close(n)), _) if n == "value" => {
                self.pos += 1;
                return Ok(RpcValue::String(String::new()));
            }
            (Some(Token::Text(text)), Some(Token::Close(n))) if n == "value" => {
                let text = text.clone();
                self.pos += 2;
                return Ok(RpcValue::String(text));
            }
            _ => {}
        }

        self.skip_whitespace();
        let kind = match self.tokens.get(self.pos) {
            Some(Token::Open(kind)) => kind.clone(),
            _ => return Err(self.unexpected("a value type")),
        };
        self.pos += 1;

        let value = match kind.as_str() {
            "i4" | "int" | "i8" | "i2" | "i1" => {
                let text = self.text_until_close(&kind)?;
                let int: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| XmlRpcError::malformed(format!("bad integer {text:?}")))?;
                RpcValue::from(int)
            }
            "boolean" => {
                let text = self.text_until_close(&kind)?;
                match text.trim() {
                    "1" | "true" => RpcValue::Bool(true),
                    "0" | "false" => RpcValue::Bool(false),
                    other => return Err(XmlRpcError::malformed(format!("bad boolean {other:?}"))),
                }
            }
            "double" | "float" => {
                let text = self.text_until_close(&kind)?;
                let float: f64 = text
                    .trim()
                    .parse()
                    .map_err(|_| XmlRpcError::malformed(format!("bad double {text:?}")))?;
                serde_json::Number::from_f64(float)
                    .map(RpcValue::Number)
                    .unwrap_or(RpcValue::Null)
            }
            "string" | "dateTime.iso8601" | "base64" => RpcValue::String(self.text_until_close(&kind)?),
            "nil" => {
                self.close("nil")?;
                RpcValue::Null
            }
            "struct" => {
                let mut members = RpcStruct::new();
                while self.at_open("member") {
                    self.open("member")?;
                    self.open("name")?;
                    let name = self.text_until_close("name")?;
                    let member = self.value()?;
                    self.close("member")?;
                    members.insert(name, member);
                }
                self.close("struct")?;
                RpcValue::Object(members)
            }
            "array" => {
                let mut items = Vec::new();
                self.open("data")?;
                while self.at_open("value") {
                    items.push(self.value()?);
                }
                self.close("data")?;
                self.close("array")?;
                RpcValue::Array(items)
            }
            other => return Err(XmlRpcError::malformed(format!("unknown value type <{other}>"))),
        };

        self.close("value")?;
        Ok(value)
    }
}

/// Flatten the document into open/close/text tokens. Namespace prefixes are
/// dropped (`ex:nil` reads as `nil`), adjacent text and CDATA are merged.
fn tokenize(xml: &str) -> Result<Vec<Token>, XmlRpcError> {
    let mut reader = Reader::from_str(xml);
    let mut tokens = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(element) => tokens.push(Token::Open(tag_name(element.local_name().as_ref()))),
            Event::Empty(element) => {
                let name = tag_name(element.local_name().as_ref());
                tokens.push(Token::Open(name.clone()));
                tokens.push(Token::Close(name));
            }
            Event::End(element) => tokens.push(Token::Close(tag_name(element.local_name().as_ref()))),
            Event::Text(text) => push_text(&mut tokens, &text.unescape()?),
            Event::CData(data) => {
                let text = data.decode().map_err(quick_xml::Error::from)?;
                push_text(&mut tokens, &text);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(tokens)
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn push_text(tokens: &mut Vec<Token>, text: &str) {
    if let Some(Token::Text(previous)) = tokens.last_mut() {
        previous.push_str(text);
    } else {
        tokens.push(Token::Text(text.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_event_call() {
        let xml = r#"<?xml version="1.0"?>
<methodCall>
  <methodName>event</methodName>
  <params>
    <param><value><string>hmbridge-rf</string></value></param>
    <param><value>AAA:1</value></param>
    <param><value><string>STATE</string></value></param>
    <param><value><boolean>1</boolean></value></param>
  </params>
</methodCall>"#;

        let (method, params) = decode_call(xml).unwrap();
        assert_eq!(method, "event");
        assert_eq!(params, vec![json!("hmbridge-rf"), json!("AAA:1"), json!("STATE"), json!(true)]);
    }

    #[test]
    fn test_decode_new_devices_structs() {
        let xml = "<methodCall><methodName>newDevices</methodName><params>\
            <param><value>hmbridge-rf</value></param>\
            <param><value><array><data>\
              <value><struct>\
                <member><name>ADDRESS</name><value>AAA</value></member>\
                <member><name>VERSION</name><value><i4>12</i4></value></member>\
                <member><name>PARAMSETS</name><value><array><data>\
                  <value>MASTER</value><value>VALUES</value>\
                </data></array></value></member>\
              </struct></value>\
            </data></array></value></param>\
            </params></methodCall>";

        let (method, params) = decode_call(xml).unwrap();
        assert_eq!(method, "newDevices");
        assert_eq!(
            params[1],
            json!([{"ADDRESS": "AAA", "VERSION": 12, "PARAMSETS": ["MASTER", "VALUES"]}])
        );
    }

    #[test]
    fn test_decode_scalar_types() {
        let xml = "<methodCall><methodName>m</methodName><params>\
            <param><value><double>21.5</double></value></param>\
            <param><value><int>-3</int></value></param>\
            <param><value><i8>5000000000</i8></value></param>\
            <param><value><ex:nil/></value></param>\
            <param><value></value></param>\
            <param><value><string>a &amp; b</string></value></param>\
            <param><value><string><![CDATA[<raw>]]></string></value></param>\
            </params></methodCall>";

        let (_, params) = decode_call(xml).unwrap();
        assert_eq!(
            params,
            vec![
                json!(21.5),
                json!(-3),
                json!(5_000_000_000i64),
                RpcValue::Null,
                json!(""),
                json!("a & b"),
                json!("<raw>"),
            ]
        );
    }

    #[test]
    fn test_decode_call_without_params() {
        let (method, params) =
            decode_call("<methodCall><methodName>system.listMethods</methodName></methodCall>").unwrap();
        assert_eq!(method, "system.listMethods");
        assert!(params.is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_call("{\"method\": \"event\"}").is_err());
        assert!(decode_call("<methodCall><methodName></methodName></methodCall>").is_err());
        assert!(matches!(
            decode_call("<methodCall><methodName>x</methodName><params><param><value><blob/></value></param></params></methodCall>"),
            Err(XmlRpcError::Malformed(_))
        ));
    }

    #[test]
    fn test_call_encoding_decodes_back() {
        let params = vec![
            json!("http://10.0.0.5:8090"),
            json!("hmbridge-rf"),
            json!({"ON": true, "LEVEL": 0.5, "name": "<kitchen>"}),
            json!([1, null]),
        ];
        let xml = encode_call("init", &params);
        assert!(xml.contains("<methodName>init</methodName>"));
        assert!(xml.contains("&lt;kitchen&gt;"));

        let (method, decoded) = decode_call(&xml).unwrap();
        assert_eq!(method, "init");
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_decode_response_value_and_void() {
        let xml = "<methodResponse><params><param><value><array><data>\
            <value><i4>1</i4></value></data></array></value></param></params></methodResponse>";
        assert_eq!(decode_response(xml), Ok(json!([1])));

        assert_eq!(
            decode_response("<methodResponse><params/></methodResponse>"),
            Ok(RpcValue::Null)
        );
    }

    #[test]
    fn test_fault_response() {
        let xml = encode_fault(-2, "Unknown method");
        assert_eq!(decode_response(&xml), Err(RpcError::fault(-2, "Unknown method")));

        let err = decode_response("<html>oops</html>").unwrap_err();
        assert!(matches!(err, RpcError::InvalidResponse(_)));
    }

    #[test]
    fn test_encode_result_maps_transport_errors_to_fault() {
        let xml = encode_result(&Err(RpcError::Transport("down".to_string())));
        assert!(matches!(decode_response(&xml), Err(RpcError::Fault { code: -32000, .. })));

        let xml = encode_result(&Ok(json!(true)));
        assert!(xml.contains("<boolean>1</boolean>"));
    }
}
