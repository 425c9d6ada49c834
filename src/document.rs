use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use scraper::{ElementRef, Html};

use crate::error::DocumentError;
use crate::profile::SelectorStyle;

/// A parsed page. Never held across an `.await`: the tree is not `Send`.
pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(markup: &str, style: SelectorStyle) -> Result<Self, DocumentError> {
        let html = match style {
            SelectorStyle::Css => Html::parse_document(markup),
            SelectorStyle::Xml => {
                // Foreign (svg) content keeps XML-ish tree rules: `<link>` is not a
                // void element there and nothing gets auto-closed.
                let body = normalize_xml(markup)?;
                Html::parse_document(&format!("<svg>{body}</svg>"))
            }
        };
        Ok(Document { html })
    }

    pub fn root(&self) -> ElementRef<'_> {
        self.html.root_element()
    }
}

/// Re-serialize an XML feed: CDATA becomes escaped text, prolog and comments go.
fn normalize_xml(xml: &str) -> Result<String, DocumentError> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::new());

    loop {
        let event = reader.read_event().map_err(|e| DocumentError::Xml {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
        let written = match event {
            Event::Eof => break,
            Event::Decl(_) | Event::PI(_) | Event::DocType(_) | Event::Comment(_) => continue,
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                writer.write_event(Event::Text(BytesText::new(&text)))
            }
            other => writer.write_event(other),
        };
        written.map_err(|e| DocumentError::Xml {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;
    }

    Ok(String::from_utf8_lossy(&writer.into_inner()).into_owned())
}
