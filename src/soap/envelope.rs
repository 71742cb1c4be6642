//! SOAP 1.1 envelope codec for the partner API.
//!
//! Bodies are plain JSON trees: a key starting with `@_` becomes an XML
//! attribute on its parent element, an array fans out into repeated
//! sibling elements, everything else becomes a child element. The reader
//! applies the inverse convention except that attributes are dropped and
//! repeated siblings are promoted to arrays.

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{json, Map, Value};

use crate::error::Error;
use crate::SOAP_ENVELOPE_NAMESPACE;

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const FUELOAUTH_NAMESPACE: &str = "http://exacttarget.com";

const ATTRIBUTE_PREFIX: &str = "@_";

/// Wraps a request body in a SOAP 1.1 envelope carrying the bearer token
/// in a `fueloauth` header.
pub(crate) fn build_envelope(body: &Value, access_token: &str) -> Result<String, Error> {
    let Value::Object(elements) = body else {
        return Err(Error::Validation(
            "SOAP request body must be an object".to_string(),
        ));
    };

    let mut xml = String::with_capacity(512);
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    xml.push_str(&format!(
        "<s:Envelope xmlns:s=\"{SOAP_ENVELOPE_NAMESPACE}\" \
         xmlns:xsi=\"{XSI_NAMESPACE}\" xmlns:xsd=\"{XSD_NAMESPACE}\">"
    ));
    xml.push_str("<s:Header>");
    xml.push_str(&format!(
        "<fueloauth xmlns=\"{FUELOAUTH_NAMESPACE}\">{}</fueloauth>",
        escape(access_token)
    ));
    xml.push_str("</s:Header>");
    xml.push_str("<s:Body>");
    for (name, value) in elements {
        write_element(&mut xml, name, value)?;
    }
    xml.push_str("</s:Body>");
    xml.push_str("</s:Envelope>");
    Ok(xml)
}

fn write_element(xml: &mut String, name: &str, value: &Value) -> Result<(), Error> {
    match value {
        Value::Array(items) => {
            for item in items {
                write_element(xml, name, item)?;
            }
        }
        Value::Object(fields) => {
            xml.push('<');
            xml.push_str(name);
            for (key, attr) in fields {
                if let Some(attr_name) = key.strip_prefix(ATTRIBUTE_PREFIX) {
                    xml.push(' ');
                    xml.push_str(attr_name);
                    xml.push_str("=\"");
                    xml.push_str(&escape(&scalar_text(attr)?));
                    xml.push('"');
                }
            }
            xml.push('>');
            for (key, child) in fields {
                if !key.starts_with(ATTRIBUTE_PREFIX) {
                    write_element(xml, key, child)?;
                }
            }
            xml.push_str("</");
            xml.push_str(name);
            xml.push('>');
        }
        Value::Null => {
            xml.push('<');
            xml.push_str(name);
            xml.push_str("/>");
        }
        scalar => {
            xml.push('<');
            xml.push_str(name);
            xml.push('>');
            xml.push_str(&escape(&scalar_text(scalar)?));
            xml.push_str("</");
            xml.push_str(name);
            xml.push('>');
        }
    }
    Ok(())
}

fn scalar_text(value: &Value) -> Result<String, Error> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Validation(format!(
            "cannot serialize {other} as XML text"
        ))),
    }
}

/// Translates a raw SOAP response body to a JSON tree.
///
/// Repeated sibling elements become arrays, leaf text is trimmed and
/// inner whitespace collapsed, XML attributes are not represented.
pub(crate) fn xml_to_value(raw: &str) -> Result<Value, Error> {
    struct Node {
        name: String,
        children: Map<String, Value>,
        text: String,
    }

    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Node {
        name: String::new(),
        children: Map::new(),
        text: String::new(),
    }];

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                stack.push(Node {
                    name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                    children: Map::new(),
                    text: String::new(),
                });
            }
            Event::Empty(empty) => {
                let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    insert_child(&mut parent.children, name, Value::String(String::new()));
                }
            }
            Event::Text(text) => {
                let unescaped = text.unescape()?;
                if let Some(node) = stack.last_mut() {
                    if !node.text.is_empty() {
                        node.text.push(' ');
                    }
                    node.text.push_str(&unescaped);
                }
            }
            Event::CData(cdata) => {
                let bytes = cdata.into_inner();
                let chunk = String::from_utf8_lossy(&bytes);
                if let Some(node) = stack.last_mut() {
                    node.text.push_str(&chunk);
                }
            }
            Event::End(_) => {
                // The reader rejects unbalanced tags, so a closed node
                // always has a parent on the stack.
                if stack.len() < 2 {
                    continue;
                }
                if let Some(node) = stack.pop() {
                    let value = if node.children.is_empty() {
                        Value::String(normalize_text(&node.text))
                    } else {
                        Value::Object(node.children)
                    };
                    if let Some(parent) = stack.last_mut() {
                        insert_child(&mut parent.children, node.name, value);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let root = stack.pop().map(|node| node.children).unwrap_or_default();
    Ok(Value::Object(root))
}

fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classifies a parsed SOAP response and extracts the payload under
/// `response_key`.
///
/// Checked in order: transport fault, missing payload, `OverallStatus`
/// content errors. `Results` is always normalized to an array so callers
/// never branch on single-result responses.
pub(crate) fn parse_response(raw: &str, status: u16, response_key: &str) -> Result<Value, Error> {
    let document = xml_to_value(raw)?;
    let body = document
        .get("soap:Envelope")
        .and_then(|envelope| envelope.get("soap:Body"));

    let Some(body) = body else {
        return Err(unclassified(status, document));
    };

    if let Some(fault) = body.get("soap:Fault") {
        return Err(Error::Soap {
            code: text_at(fault, "faultcode").unwrap_or_else(|| status.to_string()),
            message: text_at(fault, "faultstring").unwrap_or_else(|| "SOAP Fault".to_string()),
            fault: Some(fault.clone()),
        });
    }

    let Some(payload) = body.get(response_key) else {
        return Err(unclassified(status, body.clone()));
    };
    let mut payload = payload.clone();

    if let Some(overall) = payload.get("OverallStatus").and_then(Value::as_str) {
        if overall == "Error" || overall == "Has Errors" {
            return Err(Error::Soap {
                code: overall.to_string(),
                message: "One or more errors in the Results".to_string(),
                fault: Some(payload),
            });
        }
        if let Some(detail) = overall.strip_prefix("Error:") {
            let message = detail.trim().to_string();
            return Err(Error::Soap {
                code: "Error".to_string(),
                message,
                fault: Some(payload),
            });
        }
    }

    if let Some(results) = payload.get_mut("Results") {
        if !results.is_array() {
            let single = results.take();
            *results = Value::Array(vec![single]);
        }
    }
    Ok(payload)
}

fn unclassified(status: u16, detail: Value) -> Error {
    if status > 299 {
        Error::Soap {
            code: status.to_string(),
            message: "Error with SOAP Request".to_string(),
            fault: Some(detail),
        }
    } else {
        Error::Soap {
            code: "520".to_string(),
            message: "Unknown Error".to_string(),
            fault: Some(detail),
        }
    }
}

fn text_at(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Translates a caller filter tree to the partner API's typed filter
/// parts.
///
/// A node whose left and right operands are both objects becomes a
/// `ComplexFilterPart`; any other node becomes a `SimpleFilterPart`.
/// Nesting depth is unbounded.
pub(crate) fn build_filter(filter: &Value) -> Result<Value, Error> {
    let left = filter.get("leftOperand").ok_or_else(filter_shape_error)?;
    let operator = filter
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(filter_shape_error)?;
    let right = filter.get("rightOperand").ok_or_else(filter_shape_error)?;

    if left.is_object() && right.is_object() {
        Ok(json!({
            "@_xsi:type": "ComplexFilterPart",
            "LeftOperand": build_filter(left)?,
            "LogicalOperator": operator,
            "RightOperand": build_filter(right)?,
        }))
    } else {
        Ok(json!({
            "@_xsi:type": "SimpleFilterPart",
            "Property": left,
            "SimpleOperator": operator,
            "Value": right,
        }))
    }
}

fn filter_shape_error() -> Error {
    Error::Validation(
        "filter must define leftOperand, operator and rightOperand".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PARTNER_API_NAMESPACE;

    #[test]
    fn envelope_carries_token_header_and_body() {
        let body = json!({
            "RetrieveRequestMsg": {
                "@_xmlns": PARTNER_API_NAMESPACE,
                "RetrieveRequest": {
                    "ObjectType": "DataExtension",
                    "Properties": ["CustomerKey", "Name"],
                },
            },
        });
        let xml = build_envelope(&body, "secret-token").unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            "<fueloauth xmlns=\"http://exacttarget.com\">secret-token</fueloauth>"
        ));
        assert!(xml.contains(
            "<RetrieveRequestMsg xmlns=\"http://exacttarget.com/wsdl/partnerAPI\">"
        ));
        assert!(xml.contains(
            "<Properties>CustomerKey</Properties><Properties>Name</Properties>"
        ));
        assert!(xml.ends_with("</s:Body></s:Envelope>"));
    }

    #[test]
    fn attribute_keys_become_xml_attributes() {
        let body = json!({
            "CreateRequest": {
                "Objects": {
                    "@_xsi:type": "DataExtension",
                    "Name": "Example",
                },
            },
        });
        let xml = build_envelope(&body, "t").unwrap();
        assert!(xml.contains("<Objects xsi:type=\"DataExtension\"><Name>Example</Name></Objects>"));
    }

    #[test]
    fn text_and_attribute_values_are_escaped() {
        let body = json!({
            "ExecuteRequestMsg": {
                "Requests": {
                    "@_note": "a<b",
                    "Name": "Fish & Chips",
                },
            },
        });
        let xml = build_envelope(&body, "a&b").unwrap();
        assert!(xml.contains(">a&amp;b</fueloauth>"));
        assert!(xml.contains("note=\"a&lt;b\""));
        assert!(xml.contains("<Name>Fish &amp; Chips</Name>"));
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(matches!(
            build_envelope(&json!("nope"), "t"),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn repeated_siblings_become_arrays() {
        let value = xml_to_value(
            "<root><Item>a</Item><Item>b</Item><Only>c</Only></root>",
        )
        .unwrap();
        assert_eq!(value["root"]["Item"], json!(["a", "b"]));
        assert_eq!(value["root"]["Only"], json!("c"));
    }

    #[test]
    fn leaf_text_is_trimmed_and_collapsed() {
        let value = xml_to_value("<root><Msg>  hello\n   world </Msg></root>").unwrap();
        assert_eq!(value["root"]["Msg"], json!("hello world"));
    }

    #[test]
    fn empty_elements_become_empty_strings() {
        let value = xml_to_value("<root><Empty/><Also></Also></root>").unwrap();
        assert_eq!(value["root"]["Empty"], json!(""));
        assert_eq!(value["root"]["Also"], json!(""));
    }

    #[test]
    fn malformed_xml_is_an_xml_error() {
        assert!(matches!(
            xml_to_value("<root><unclosed></root>"),
            Err(Error::Xml(_))
        ));
    }

    fn wrap(inner: &str) -> String {
        format!(
            "<soap:Envelope xmlns:soap=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <soap:Body>{inner}</soap:Body></soap:Envelope>"
        )
    }

    #[test]
    fn fault_takes_precedence() {
        let raw = wrap(
            "<soap:Fault><faultcode>soap:Client</faultcode>\
             <faultstring>Token Expired</faultstring></soap:Fault>",
        );
        match parse_response(&raw, 500, "RetrieveResponseMsg") {
            Err(Error::Soap { code, message, .. }) => {
                assert_eq!(code, "soap:Client");
                assert_eq!(message, "Token Expired");
            }
            other => panic!("expected soap error, got {other:?}"),
        }
    }

    #[test]
    fn missing_payload_with_error_status_reports_the_status() {
        let raw = wrap("<SomethingElse>x</SomethingElse>");
        match parse_response(&raw, 500, "RetrieveResponseMsg") {
            Err(Error::Soap { code, message, .. }) => {
                assert_eq!(code, "500");
                assert_eq!(message, "Error with SOAP Request");
            }
            other => panic!("expected soap error, got {other:?}"),
        }
    }

    #[test]
    fn missing_payload_with_ok_status_is_unknown() {
        let raw = wrap("<SomethingElse>x</SomethingElse>");
        match parse_response(&raw, 200, "RetrieveResponseMsg") {
            Err(Error::Soap { code, message, .. }) => {
                assert_eq!(code, "520");
                assert_eq!(message, "Unknown Error");
            }
            other => panic!("expected soap error, got {other:?}"),
        }
    }

    #[test]
    fn overall_status_error_is_a_content_error_with_details() {
        let raw = wrap(
            "<CreateResponse><OverallStatus>Has Errors</OverallStatus>\
             <Results><StatusCode>Error</StatusCode></Results></CreateResponse>",
        );
        match parse_response(&raw, 200, "CreateResponse") {
            Err(Error::Soap {
                code,
                message,
                fault,
            }) => {
                assert_eq!(code, "Has Errors");
                assert_eq!(message, "One or more errors in the Results");
                assert!(fault.unwrap().get("Results").is_some());
            }
            other => panic!("expected soap error, got {other:?}"),
        }
    }

    #[test]
    fn overall_status_error_prefix_extracts_the_message() {
        let raw = wrap(
            "<RetrieveResponseMsg>\
             <OverallStatus>Error: The Request Property(s) Foo do not match</OverallStatus>\
             </RetrieveResponseMsg>",
        );
        match parse_response(&raw, 200, "RetrieveResponseMsg") {
            Err(Error::Soap { code, message, .. }) => {
                assert_eq!(code, "Error");
                assert_eq!(message, "The Request Property(s) Foo do not match");
            }
            other => panic!("expected soap error, got {other:?}"),
        }
    }

    #[test]
    fn single_result_is_normalized_to_an_array() {
        let raw = wrap(
            "<RetrieveResponseMsg><OverallStatus>OK</OverallStatus>\
             <Results><Name>only</Name></Results></RetrieveResponseMsg>",
        );
        let payload = parse_response(&raw, 200, "RetrieveResponseMsg").unwrap();
        assert_eq!(payload["Results"], json!([{"Name": "only"}]));
    }

    #[test]
    fn multiple_results_stay_an_array() {
        let raw = wrap(
            "<RetrieveResponseMsg><OverallStatus>OK</OverallStatus>\
             <Results><Name>a</Name></Results><Results><Name>b</Name></Results>\
             </RetrieveResponseMsg>",
        );
        let payload = parse_response(&raw, 200, "RetrieveResponseMsg").unwrap();
        assert_eq!(payload["Results"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn simple_filter_maps_to_simple_filter_part() {
        let filter = json!({
            "leftOperand": "Name",
            "operator": "equals",
            "rightOperand": "Example",
        });
        assert_eq!(
            build_filter(&filter).unwrap(),
            json!({
                "@_xsi:type": "SimpleFilterPart",
                "Property": "Name",
                "SimpleOperator": "equals",
                "Value": "Example",
            })
        );
    }

    #[test]
    fn nested_filters_map_to_complex_filter_parts() {
        let filter = json!({
            "leftOperand": {
                "leftOperand": "Name",
                "operator": "equals",
                "rightOperand": "Example",
            },
            "operator": "AND",
            "rightOperand": {
                "leftOperand": {
                    "leftOperand": "IsActive",
                    "operator": "equals",
                    "rightOperand": "true",
                },
                "operator": "OR",
                "rightOperand": {
                    "leftOperand": "Status",
                    "operator": "notEquals",
                    "rightOperand": "Deleted",
                },
            },
        });
        let built = build_filter(&filter).unwrap();
        assert_eq!(built["@_xsi:type"], "ComplexFilterPart");
        assert_eq!(built["LogicalOperator"], "AND");
        assert_eq!(built["LeftOperand"]["@_xsi:type"], "SimpleFilterPart");
        assert_eq!(built["RightOperand"]["@_xsi:type"], "ComplexFilterPart");
        assert_eq!(
            built["RightOperand"]["RightOperand"]["Property"],
            "Status"
        );
    }

    #[test]
    fn filter_missing_operand_is_rejected() {
        assert!(matches!(
            build_filter(&json!({"leftOperand": "Name"})),
            Err(Error::Validation(_))
        ));
    }
}
