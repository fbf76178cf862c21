//! Kobo reader markup injection
//!
//! The Kobo firmware's paging and highlight anchoring work off
//! `koboSpan` markers wrapped around sentence-like runs of text. The
//! transform streams each spine XHTML document and wraps every text
//! segment inside `body`, numbering spans `kobo.<paragraph>.<sentence>`.

use std::io::Cursor;
use std::sync::OnceLock;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;

/// Elements whose text content is never wrapped.
const SKIP_ELEMENTS: [&[u8]; 6] = [b"script", b"style", b"svg", b"head", b"title", b"pre"];

/// Block-level elements that advance the paragraph counter.
const BLOCK_ELEMENTS: [&[u8]; 13] = [
    b"p",
    b"div",
    b"h1",
    b"h2",
    b"h3",
    b"h4",
    b"h5",
    b"h6",
    b"li",
    b"blockquote",
    b"td",
    b"figcaption",
    b"section",
];

/// Sentence-like runs: text up to and including closing punctuation plus
/// trailing whitespace.
fn sentence_runs(text: &str) -> Vec<String> {
    static RUNS: OnceLock<Regex> = OnceLock::new();
    let runs = RUNS
        .get_or_init(|| Regex::new(r#"[^.!?\u{2026}]*[.!?\u{2026}]+["')\]]*\s*|[^.!?\u{2026}]+$"#).unwrap());
    runs.find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Inject Kobo span markers into one XHTML document.
pub fn kepubify_xhtml(xml: &str) -> Result<String, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut in_body = false;
    let mut skip_depth = 0usize;
    let mut paragraph = 0u32;
    let mut sentence = 0u32;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                if local == b"body" {
                    in_body = true;
                } else if SKIP_ELEMENTS.contains(&local.as_slice()) {
                    skip_depth += 1;
                } else if in_body && BLOCK_ELEMENTS.contains(&local.as_slice()) {
                    paragraph += 1;
                    sentence = 0;
                }
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                if local == b"body" {
                    in_body = false;
                } else if SKIP_ELEMENTS.contains(&local.as_slice()) {
                    skip_depth = skip_depth.saturating_sub(1);
                }
                writer.write_event(Event::End(e))?;
            }
            Event::Text(t) => {
                let text = t.unescape()?.into_owned();
                if !in_body || skip_depth > 0 || text.trim().is_empty() {
                    // Untouched text passes through with its original escaping.
                    writer.write_event(Event::Text(t))?;
                    continue;
                }
                if paragraph == 0 {
                    paragraph = 1;
                }
                for run in sentence_runs(&text) {
                    sentence += 1;
                    let mut span = BytesStart::new("span");
                    span.push_attribute(("class", "koboSpan"));
                    span.push_attribute(("id", format!("kobo.{paragraph}.{sentence}").as_str()));
                    writer.write_event(Event::Start(span))?;
                    writer.write_event(Event::Text(BytesText::new(&run)))?;
                    writer.write_event(Event::End(BytesEnd::new("span")))?;
                }
            }
            Event::Eof => break,
            other => writer.write_event(other)?,
        }
    }

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentence_runs() {
        let runs = sentence_runs("One sentence. Another one! And a tail");
        assert_eq!(runs, vec!["One sentence. ", "Another one! ", "And a tail"]);
    }

    #[test]
    fn test_spans_injected_in_body() {
        let xml = r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Skip me.</title></head>
<body><p>First. Second!</p><p>Third.</p></body></html>"#;
        let out = kepubify_xhtml(xml).unwrap();
        assert!(out.contains(r#"<span class="koboSpan" id="kobo.1.1">First. </span>"#), "{out}");
        assert!(out.contains(r#"id="kobo.1.2">Second!</span>"#), "{out}");
        assert!(out.contains(r#"id="kobo.2.1">Third.</span>"#), "{out}");
        // The head title is untouched.
        assert!(out.contains("<title>Skip me.</title>"), "{out}");
    }

    #[test]
    fn test_script_content_untouched() {
        let xml = r#"<html xmlns="http://www.w3.org/1999/xhtml"><body>
<script>var x = "Sentence. Here!";</script><p>Real text.</p></body></html>"#;
        let out = kepubify_xhtml(xml).unwrap();
        assert!(out.contains(r#"var x = "Sentence. Here!";"#), "{out}");
        assert!(out.contains("koboSpan"), "{out}");
    }
}
