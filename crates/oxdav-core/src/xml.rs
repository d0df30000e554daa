//! XML request parsing and multistatus rendering.
//!
//! Request bodies are parsed into an `xmltree` element tree and reduced to
//! Clark-notation property names (`{namespace}local`). Responses are streamed
//! through an `xml-rs` event writer.

use http::StatusCode;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent};
use xmltree::Element;

use crate::error::{DavError, DavResult};
use crate::propfind::{PropFindKind, PropFindResponse, PropValue, XmlElement};
use crate::proppatch::Mutation;

pub const NS_DAV: &str = "DAV:";
pub const NS_OWNCLOUD: &str = "http://owncloud.org/ns";
pub const NS_NEXTCLOUD: &str = "http://nextcloud.org/ns";
pub const NS_SABRE: &str = "http://sabredav.org/ns";

/// Prefixes declared on every response root.
const PREFIXES: &[(&str, &str)] = &[
    ("d", NS_DAV),
    ("oc", NS_OWNCLOUD),
    ("nc", NS_NEXTCLOUD),
    ("s", NS_SABRE),
];

/// Split `{ns}local` into `(ns, local)`. Names without a namespace yield
/// an empty namespace.
pub fn split_clark(name: &str) -> (&str, &str) {
    name.strip_prefix('{')
        .and_then(|rest| rest.split_once('}'))
        .unwrap_or(("", name))
}

fn clark(element: &Element) -> String {
    format!(
        "{{{}}}{}",
        element.namespace.as_deref().unwrap_or_default(),
        element.name
    )
}

fn child_elements(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| node.as_element())
}

fn parse(body: &[u8]) -> DavResult<Element> {
    Element::parse(body).map_err(|e| DavError::BadRequest(format!("Malformed XML body: {e}")))
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// Parse a PROPFIND body. An empty body is an `allprop` request.
pub fn parse_propfind(body: &[u8]) -> DavResult<(PropFindKind, Vec<String>)> {
    if is_blank(body) {
        return Ok((PropFindKind::AllProps, Vec::new()));
    }
    let root = parse(body)?;
    if clark(&root) != "{DAV:}propfind" {
        return Err(DavError::BadRequest(format!(
            "Expected a {{DAV:}}propfind body, got {}",
            clark(&root)
        )));
    }

    for child in child_elements(&root) {
        match clark(child).as_str() {
            "{DAV:}allprop" => return Ok((PropFindKind::AllProps, Vec::new())),
            "{DAV:}propname" => return Ok((PropFindKind::PropName, Vec::new())),
            "{DAV:}prop" => {
                let names = child_elements(child).map(clark).collect();
                return Ok((PropFindKind::Named, names));
            }
            _ => {}
        }
    }
    Err(DavError::BadRequest(
        "propfind body needs a prop, allprop or propname element".into(),
    ))
}

/// Parse a PROPPATCH `propertyupdate` body into mutations, in document order.
pub fn parse_proppatch(body: &[u8]) -> DavResult<Vec<Mutation>> {
    let root = parse(body)?;
    if clark(&root) != "{DAV:}propertyupdate" {
        return Err(DavError::BadRequest(format!(
            "Expected a {{DAV:}}propertyupdate body, got {}",
            clark(&root)
        )));
    }

    let mut mutations = Vec::new();
    for action in child_elements(&root) {
        let set = match clark(action).as_str() {
            "{DAV:}set" => true,
            "{DAV:}remove" => false,
            _ => continue,
        };
        for prop in child_elements(action).filter(|e| clark(e) == "{DAV:}prop") {
            for element in child_elements(prop) {
                let value = set.then(|| element_value(element));
                mutations.push((clark(element), value));
            }
        }
    }
    Ok(mutations)
}

/// Text content, or a list when the property carries child elements
/// (`<oc:tags><oc:tag>a</oc:tag></oc:tags>`).
fn element_value(element: &Element) -> PropValue {
    let children: Vec<&Element> = child_elements(element).collect();
    match children.first() {
        None => PropValue::Text(
            element
                .get_text()
                .map(|t| t.trim().to_string())
                .unwrap_or_default(),
        ),
        Some(first) => PropValue::List {
            element: clark(first),
            items: children
                .iter()
                .map(|c| c.get_text().map(|t| t.trim().to_string()).unwrap_or_default())
                .collect(),
        },
    }
}

/// Clark name of a REPORT body's root element.
pub fn report_name(body: &[u8]) -> DavResult<String> {
    if is_blank(body) {
        return Err(DavError::BadRequest("REPORT requires a body".into()));
    }
    Ok(clark(&parse(body)?))
}

/// Event writer that maps Clark names onto the well-known prefixes and
/// declares ad-hoc prefixes for anything else.
struct XmlOut {
    writer: EventWriter<Vec<u8>>,
    extra_namespaces: usize,
}

fn writer_error(e: xml::writer::Error) -> DavError {
    DavError::Internal(format!("XML serialization failed: {e}"))
}

impl XmlOut {
    fn new() -> Self {
        let writer = EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true)
            .create_writer(Vec::new());
        Self {
            writer,
            extra_namespaces: 0,
        }
    }

    /// Root element with every well-known prefix declared.
    fn root(&mut self, name: &str) -> DavResult<()> {
        let (_, local) = split_clark(name);
        let qname = format!("d:{local}");
        let mut start = XmlEvent::start_element(qname.as_str());
        for (prefix, uri) in PREFIXES {
            start = start.ns(*prefix, *uri);
        }
        self.writer.write(start).map_err(writer_error)
    }

    fn start(&mut self, name: &str) -> DavResult<()> {
        let (ns, local) = split_clark(name);
        if ns.is_empty() {
            return self
                .writer
                .write(XmlEvent::start_element(local))
                .map_err(writer_error);
        }
        match PREFIXES.iter().find(|(_, uri)| *uri == ns) {
            Some((prefix, _)) => {
                let qname = format!("{prefix}:{local}");
                self.writer
                    .write(XmlEvent::start_element(qname.as_str()))
                    .map_err(writer_error)
            }
            None => {
                self.extra_namespaces += 1;
                let prefix = format!("x{}", self.extra_namespaces);
                let qname = format!("{prefix}:{local}");
                self.writer
                    .write(XmlEvent::start_element(qname.as_str()).ns(prefix.as_str(), ns))
                    .map_err(writer_error)
            }
        }
    }

    fn text(&mut self, text: &str) -> DavResult<()> {
        self.writer
            .write(XmlEvent::characters(text))
            .map_err(writer_error)
    }

    fn end(&mut self) -> DavResult<()> {
        self.writer.write(XmlEvent::end_element()).map_err(writer_error)
    }

    fn leaf(&mut self, name: &str, text: &str) -> DavResult<()> {
        self.start(name)?;
        self.text(text)?;
        self.end()
    }

    fn element(&mut self, element: &XmlElement) -> DavResult<()> {
        self.start(&element.name)?;
        if let Some(text) = &element.text {
            self.text(text)?;
        }
        for child in &element.children {
            self.element(child)?;
        }
        self.end()
    }

    fn property(&mut self, name: &str, value: Option<&PropValue>) -> DavResult<()> {
        self.start(name)?;
        match value {
            None => {}
            Some(PropValue::Text(text)) => self.text(text)?,
            Some(PropValue::Integer(n)) => self.text(&n.to_string())?,
            Some(PropValue::Href(href)) => self.leaf("{DAV:}href", href)?,
            Some(PropValue::ResourceType(types)) => {
                for t in types {
                    self.start(t)?;
                    self.end()?;
                }
            }
            Some(PropValue::List { element, items }) => {
                for item in items {
                    self.leaf(element, item)?;
                }
            }
            Some(PropValue::Xml(elements)) => {
                for element in elements {
                    self.element(element)?;
                }
            }
        }
        self.end()
    }

    fn finish(self) -> DavResult<String> {
        String::from_utf8(self.writer.into_inner())
            .map_err(|e| DavError::Internal(format!("XML output is not UTF-8: {e}")))
    }
}

/// `HTTP/1.1 207 Multi-Status` style status line.
pub fn status_line(status: StatusCode) -> String {
    format!(
        "HTTP/1.1 {} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    )
}

/// Percent-encoded href for a tree path below `base_uri`.
pub fn href(base_uri: &str, path: &str, is_collection: bool) -> String {
    let mut href = base_uri.trim_end_matches('/').to_string();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        href.push('/');
        href.push_str(&urlencoding::encode(segment));
    }
    if is_collection || path.is_empty() {
        href.push('/');
    }
    href
}

/// Render a 207 multistatus document.
pub fn multistatus(responses: &[PropFindResponse], base_uri: &str) -> DavResult<String> {
    let mut out = XmlOut::new();
    out.root("{DAV:}multistatus")?;
    for response in responses {
        out.start("{DAV:}response")?;
        out.leaf(
            "{DAV:}href",
            &href(base_uri, &response.path, response.is_collection),
        )?;
        for propstat in &response.propstats {
            out.start("{DAV:}propstat")?;
            out.start("{DAV:}prop")?;
            for (name, value) in &propstat.properties {
                out.property(name, value.as_ref())?;
            }
            out.end()?;
            out.leaf("{DAV:}status", &status_line(propstat.status))?;
            out.end()?;
        }
        out.end()?;
    }
    out.end()?;
    out.finish()
}

/// `<d:prop>` document carrying a single property, as sent in LOCK responses.
pub fn prop_document(name: &str, value: &PropValue) -> DavResult<String> {
    let mut out = XmlOut::new();
    out.root("{DAV:}prop")?;
    out.property(name, Some(value))?;
    out.end()?;
    out.finish()
}

/// `<d:error>` body describing the error that aborted a request.
pub fn error_document(error: &DavError) -> DavResult<String> {
    let mut out = XmlOut::new();
    out.root("{DAV:}error")?;
    out.leaf(
        &format!("{{{NS_SABRE}}}exception"),
        &format!("Sabre\\DAV\\Exception\\{}", error.kind()),
    )?;
    out.leaf(&format!("{{{NS_SABRE}}}message"), &error.to_string())?;
    out.end()?;
    out.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::propfind::PropStat;

    #[test]
    fn test_parse_propfind_named() {
        let body = br#"<?xml version="1.0"?>
            <d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
              <d:prop><d:getetag/><oc:tags/></d:prop>
            </d:propfind>"#;
        let (kind, names) = parse_propfind(body).unwrap();
        assert_eq!(kind, PropFindKind::Named);
        assert_eq!(names, vec!["{DAV:}getetag", "{http://owncloud.org/ns}tags"]);
    }

    #[test]
    fn test_parse_propfind_empty_is_allprop() {
        assert_eq!(parse_propfind(b"  ").unwrap().0, PropFindKind::AllProps);
        let body = br#"<propfind xmlns="DAV:"><propname/></propfind>"#;
        assert_eq!(parse_propfind(body).unwrap().0, PropFindKind::PropName);
    }

    #[test]
    fn test_parse_propfind_rejects_garbage() {
        assert!(matches!(parse_propfind(b"<not-xml"), Err(DavError::BadRequest(_))));
        assert!(matches!(
            parse_propfind(br#"<d:foo xmlns:d="DAV:"/>"#),
            Err(DavError::BadRequest(_))
        ));
    }

    #[test]
    fn test_parse_proppatch() {
        let body = br#"<d:propertyupdate xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
              <d:set><d:prop>
                <oc:favorite>1</oc:favorite>
                <oc:tags><oc:tag>a</oc:tag><oc:tag>b</oc:tag></oc:tags>
              </d:prop></d:set>
              <d:remove><d:prop><x:dead xmlns:x="urn:x"/></d:prop></d:remove>
            </d:propertyupdate>"#;
        let mutations = parse_proppatch(body).unwrap();
        assert_eq!(
            mutations,
            vec![
                (
                    "{http://owncloud.org/ns}favorite".to_string(),
                    Some(PropValue::Text("1".into()))
                ),
                (
                    "{http://owncloud.org/ns}tags".to_string(),
                    Some(PropValue::list(
                        "{http://owncloud.org/ns}tag",
                        vec!["a".into(), "b".into()]
                    ))
                ),
                ("{urn:x}dead".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_report_name() {
        let body = br#"<oc:filter-files xmlns:oc="http://owncloud.org/ns"/>"#;
        assert_eq!(report_name(body).unwrap(), "{http://owncloud.org/ns}filter-files");
        assert!(report_name(b"").is_err());
    }

    #[test]
    fn test_href_encoding() {
        assert_eq!(href("/dav/", "", true), "/dav/");
        assert_eq!(href("/dav", "My Docs/a b.txt", false), "/dav/My%20Docs/a%20b.txt");
        assert_eq!(href("/dav", "dir", true), "/dav/dir/");
    }

    #[test]
    fn test_multistatus_rendering() {
        let response = PropFindResponse {
            path: "dir".into(),
            is_collection: true,
            propstats: vec![
                PropStat {
                    status: StatusCode::OK,
                    properties: vec![
                        (
                            "{DAV:}resourcetype".into(),
                            Some(PropValue::ResourceType(vec!["{DAV:}collection".into()])),
                        ),
                        ("{urn:custom}color".into(), Some(PropValue::Text("red".into()))),
                    ],
                },
                PropStat {
                    status: StatusCode::NOT_FOUND,
                    properties: vec![("{http://owncloud.org/ns}tags".into(), None)],
                },
            ],
        };
        let xml = multistatus(&[response], "/dav").unwrap();
        assert!(xml.contains("<d:href>/dav/dir/</d:href>"));
        assert!(xml.contains("<d:collection"));
        assert!(xml.contains("HTTP/1.1 404 Not Found"));
        assert!(xml.contains(r#"xmlns:x1="urn:custom""#));
        assert!(xml.contains(">red</x1:color>"));
    }

    #[test]
    fn test_error_document() {
        let xml = error_document(&DavError::NotFound("missing.txt".into())).unwrap();
        assert!(xml.contains("Sabre\\DAV\\Exception\\NotFound"));
        assert!(xml.contains("missing.txt"));
    }
}
