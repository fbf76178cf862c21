//! Chapter tree extraction from EPUB navigation documents
//!
//! EPUB3 ships a nav XHTML document (`nav[epub:type=toc]`, nested `ol/li`);
//! EPUB2 ships an NCX (`navMap/navPoint`). Both flatten to the same arena:
//! a vector of chapters with parent indices and sibling-local sort orders.

use quick_xml::events::Event;
use quick_xml::Reader;

use crate::model::{ChapterLocator, ParsedChapter};

use super::opf::{attr, attrs_of};

/// Parse an EPUB3 nav document's table of contents.
pub fn parse_nav(xml: &str) -> Result<Vec<ParsedChapter>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut chapters: Vec<ParsedChapter> = Vec::new();

    let mut in_toc = false;
    let mut skip_navs = 0usize;
    let mut stack: Vec<usize> = Vec::new();
    let mut counters: Vec<u32> = vec![0];
    let mut capturing: Option<usize> = None;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"nav" => {
                        if in_toc {
                            skip_navs += 1;
                        } else {
                            let attrs = attrs_of(&e);
                            let nav_type = attr(&attrs, "type").unwrap_or("");
                            if nav_type.split_whitespace().any(|t| t == "toc") {
                                in_toc = true;
                            }
                        }
                    }
                    b"li" if in_toc => {
                        let parent = stack.last().copied();
                        let level = stack.len();
                        if counters.len() <= level {
                            counters.push(0);
                        }
                        let sort = counters[level];
                        counters[level] += 1;
                        chapters.push(ParsedChapter {
                            parent,
                            sort,
                            title: String::new(),
                            locator: ChapterLocator::Href(String::new()),
                            end_ms: None,
                        });
                        stack.push(chapters.len() - 1);
                    }
                    b"a" | b"span" if in_toc => {
                        if let Some(&index) = stack.last() {
                            if local == b"a" {
                                let attrs = attrs_of(&e);
                                if let Some(href) = attr(&attrs, "href") {
                                    chapters[index].locator =
                                        ChapterLocator::Href(href.to_string());
                                }
                            }
                            capturing = Some(index);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) => {
                if let Some(index) = capturing {
                    let text = t.unescape()?;
                    if chapters[index].title.is_empty() {
                        chapters[index].title = text.trim().to_string();
                    }
                }
            }
            Event::End(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"a" | b"span" => capturing = None,
                    b"li" if in_toc => {
                        stack.pop();
                        counters.truncate(stack.len() + 1);
                    }
                    b"nav" if in_toc => {
                        if skip_navs > 0 {
                            skip_navs -= 1;
                        } else {
                            break;
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(prune_untitled(chapters))
}

/// Parse an NCX navigation map.
pub fn parse_ncx(xml: &str) -> Result<Vec<ParsedChapter>, quick_xml::Error> {
    let mut reader = Reader::from_str(xml);
    let mut chapters: Vec<ParsedChapter> = Vec::new();

    let mut stack: Vec<usize> = Vec::new();
    let mut counters: Vec<u32> = vec![0];
    let mut in_label_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"navPoint" => {
                        let parent = stack.last().copied();
                        let level = stack.len();
                        if counters.len() <= level {
                            counters.push(0);
                        }
                        let sort = counters[level];
                        counters[level] += 1;
                        chapters.push(ParsedChapter {
                            parent,
                            sort,
                            title: String::new(),
                            locator: ChapterLocator::Href(String::new()),
                            end_ms: None,
                        });
                        stack.push(chapters.len() - 1);
                    }
                    b"text" => in_label_text = !stack.is_empty(),
                    _ => {}
                }
            }
            Event::Empty(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                if local == b"content" {
                    if let Some(&index) = stack.last() {
                        let attrs = attrs_of(&e);
                        if let Some(src) = attr(&attrs, "src") {
                            chapters[index].locator = ChapterLocator::Href(src.to_string());
                        }
                    }
                }
            }
            Event::Text(t) => {
                if in_label_text {
                    if let Some(&index) = stack.last() {
                        if chapters[index].title.is_empty() {
                            chapters[index].title = t.unescape()?.trim().to_string();
                        }
                    }
                }
            }
            Event::End(e) => {
                let local = e.name().local_name().as_ref().to_vec();
                match local.as_slice() {
                    b"text" => in_label_text = false,
                    b"navPoint" => {
                        stack.pop();
                        counters.truncate(stack.len() + 1);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(prune_untitled(chapters))
}

/// Drop entries that ended up with neither title nor href (layout-only
/// `li` wrappers), remapping parent indices.
fn prune_untitled(chapters: Vec<ParsedChapter>) -> Vec<ParsedChapter> {
    let keep: Vec<bool> = chapters
        .iter()
        .map(|c| {
            !c.title.is_empty()
                || !matches!(&c.locator, ChapterLocator::Href(h) if h.is_empty())
        })
        .collect();
    if keep.iter().all(|&k| k) {
        return chapters;
    }

    // Children of a dropped wrapper are re-parented to the nearest kept
    // ancestor.
    let original_parents: Vec<Option<usize>> = chapters.iter().map(|c| c.parent).collect();
    let mut remap: Vec<Option<usize>> = Vec::with_capacity(chapters.len());
    let mut kept: Vec<ParsedChapter> = Vec::new();
    for (index, chapter) in chapters.into_iter().enumerate() {
        if keep[index] {
            remap.push(Some(kept.len()));
            kept.push(chapter);
        } else {
            remap.push(None);
        }
    }
    for chapter in &mut kept {
        let mut current = chapter.parent;
        chapter.parent = loop {
            match current {
                Some(p) => match remap[p] {
                    Some(new_index) => break Some(new_index),
                    None => current = original_parents[p],
                },
                None => break None,
            }
        };
    }
    kept
}
