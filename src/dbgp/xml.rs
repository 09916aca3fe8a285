//! DBGp XML response assembly. Responses are small and fixed in shape, so
//! they are built from format templates rather than an XML writer.

const DBGP_NS: &str = "urn:debugger_protocol_v1";

/// The init packet sent right after the IDE connection is established.
pub fn init_packet(entry_file: &str, appid: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="iso-8859-1"?>
<init xmlns="{DBGP_NS}" xmlns:xdebug="https://xdebug.org/dbgp/xdebug" fileuri="{}" language="PHP" protocol_version="1.0" appid="{appid}" idekey="retrograde"><engine version="{}"><![CDATA[retrograde]]></engine><copyright><![CDATA[replayed with rr, served backwards]]></copyright></init>"#,
        escape(entry_file),
        env!("CARGO_PKG_VERSION"),
    )
}

/// A `<response .../>` with extra attributes and an optional body.
pub fn response(verb: &str, seq: u64, attrs: &[(&str, &str)], body: Option<&str>) -> String {
    let mut out = format!(r#"<response xmlns="{DBGP_NS}" command="{verb}" transaction_id="{seq}""#);
    for (name, value) in attrs {
        out.push_str(&format!(r#" {name}="{}""#, escape(value)));
    }
    match body {
        Some(body) => {
            out.push('>');
            out.push_str(body);
            out.push_str("</response>");
        }
        None => out.push_str("></response>"),
    }
    out
}

/// An `<error code="..">` response.
pub fn error_response(verb: &str, seq: u64, code: u32, message: &str) -> String {
    let body = format!(
        "<error code=\"{code}\"><message><![CDATA[{message}]]></message></error>"
    );
    response(verb, seq, &[], Some(&body))
}

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_response_shape() {
        let xml = response("status", 7, &[("status", "break"), ("reason", "ok")], None);
        assert_eq!(
            xml,
            "<response xmlns=\"urn:debugger_protocol_v1\" command=\"status\" \
             transaction_id=\"7\" status=\"break\" reason=\"ok\"></response>"
        );
    }

    #[test]
    fn test_attrs_are_escaped() {
        let xml = response("feature_get", 2, &[("v", "a<b&\"c\"")], None);
        assert!(xml.contains("v=\"a&lt;b&amp;&quot;c&quot;\""));
    }

    #[test]
    fn test_error_response() {
        let xml = error_response("breakpoint_set", 9, 201, "unsupported breakpoint type `watch`");
        assert!(xml.contains("transaction_id=\"9\""));
        assert!(xml.contains("<error code=\"201\">"));
        assert!(xml.contains("unsupported breakpoint type"));
    }

    #[test]
    fn test_init_packet_mentions_entry_file() {
        let xml = init_packet("file:///tmp/a.php", 4242);
        assert!(xml.contains("fileuri=\"file:///tmp/a.php\""));
        assert!(xml.contains("appid=\"4242\""));
        assert!(xml.contains("idekey=\"retrograde\""));
    }
}
