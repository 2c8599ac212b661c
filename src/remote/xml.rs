//! Minimal XML reading over `quick-xml`.
//!
//! Documents are flattened into the list of their elements in closing order,
//! each carrying its local name, attributes and direct text. That is enough
//! for WS-Man replies and CLIXML streams, which never need ancestry.

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// One element of a flattened document.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Element {
    pub(crate) name: String,
    attributes: Vec<(String, String)>,
    pub(crate) text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attribute = attr?;
            attributes.push((
                String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned(),
                attribute.unescape_value()?.into_owned(),
            ));
        }
        Ok(Self {
            name: String::from_utf8_lossy(start.local_name().as_ref()).into_owned(),
            attributes,
            text: String::new(),
        })
    }

    /// Value of the attribute with the given local name.
    pub(crate) fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Parses `document` into its elements.
///
/// Mismatched end tags are reported as errors.
pub(crate) fn elements(document: &str) -> Result<Vec<Element>, quick_xml::Error> {
    let mut reader = Reader::from_str(document);
    let mut open: Vec<Element> = Vec::new();
    let mut closed = Vec::new();
    loop {
        match reader.read_event()? {
            Event::Start(start) => open.push(Element::from_start(&start)?),
            Event::Empty(start) => closed.push(Element::from_start(&start)?),
            Event::Text(text) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = open.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                if let Some(finished) = open.pop() {
                    closed.push(finished);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(closed)
}

/// Text of the first element named `name`.
pub(crate) fn first_text<'a>(elements: &'a [Element], name: &str) -> Option<&'a str> {
    elements
        .iter()
        .find(|element| element.name == name)
        .map(|element| element.text.trim())
}
