//! OPF package document model
//!
//! Event-based parse of `metadata`, `manifest`, `spine`, and `guide`.
//! Element and attribute names are matched by local name so `dc:` / `opf:`
//! prefix variations across real-world files all resolve the same way.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// A `dc:title` element
#[derive(Debug, Clone, Default)]
pub struct OpfTitle {
    pub text: String,
    pub id: Option<String>,
}

/// A `dc:creator` element
#[derive(Debug, Clone, Default)]
pub struct OpfCreator {
    pub name: String,
    pub id: Option<String>,
    /// `opf:role` attribute, as written
    pub role_attr: Option<String>,
    /// `opf:file-as` attribute
    pub file_as: Option<String>,
}

/// A `dc:identifier` element
#[derive(Debug, Clone, Default)]
pub struct OpfIdentifier {
    pub scheme: Option<String>,
    pub id: Option<String>,
    pub value: String,
}

/// A `meta` element, covering both the OPF2 (`name`/`content`) and EPUB3
/// (`property`/`refines` + text) shapes
#[derive(Debug, Clone, Default)]
pub struct OpfMeta {
    pub name: Option<String>,
    pub content: Option<String>,
    pub property: Option<String>,
    pub refines: Option<String>,
    pub id: Option<String>,
    pub text: Option<String>,
}

/// A `manifest` item
#[derive(Debug, Clone, Default)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: Option<String>,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .map(|p| p.split_whitespace().any(|token| token == property))
            .unwrap_or(false)
    }
}

/// A `spine` itemref
#[derive(Debug, Clone, Default)]
pub struct SpineItemRef {
    pub idref: String,
}

/// A `guide` reference
#[derive(Debug, Clone, Default)]
pub struct GuideReference {
    pub ref_type: Option<String>,
    pub href: Option<String>,
    pub title: Option<String>,
}

/// Parsed OPF package document
#[derive(Debug, Clone, Default)]
pub struct OpfDocument {
    pub unique_identifier: Option<String>,
    pub titles: Vec<OpfTitle>,
    pub creators: Vec<OpfCreator>,
    pub language: Option<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub date: Option<String>,
    pub subjects: Vec<String>,
    pub identifiers: Vec<OpfIdentifier>,
    pub metas: Vec<OpfMeta>,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<SpineItemRef>,
    /// `toc` attribute on `spine` (NCX manifest id)
    pub spine_toc: Option<String>,
    pub guide: Vec<GuideReference>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Metadata,
    Manifest,
    Spine,
    Guide,
}

struct Capture {
    kind: CaptureKind,
    attrs: Vec<(String, String)>,
    text: String,
    depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CaptureKind {
    Title,
    Creator,
    Identifier,
    Meta,
    Language,
    Publisher,
    Description,
    Date,
    Subject,
    Other,
}

pub(crate) fn attrs_of(e: &BytesStart) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .filter_map(|a| {
            let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
            let value = a.unescape_value().ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

pub(crate) fn attr<'a>(attrs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl OpfDocument {
    pub fn parse(xml: &str) -> Result<Self, quick_xml::Error> {
        let mut reader = Reader::from_str(xml);
        let mut doc = OpfDocument::default();
        let mut section = Section::None;
        let mut capture: Option<Capture> = None;

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let local = e.name().local_name().as_ref().to_vec();
                    if let Some(cap) = capture.as_mut() {
                        cap.depth += 1;
                        continue;
                    }
                    match local.as_slice() {
                        b"package" => {
                            let attrs = attrs_of(&e);
                            doc.unique_identifier =
                                attr(&attrs, "unique-identifier").map(str::to_string);
                        }
                        b"metadata" => section = Section::Metadata,
                        b"manifest" => section = Section::Manifest,
                        b"spine" => {
                            section = Section::Spine;
                            let attrs = attrs_of(&e);
                            doc.spine_toc = attr(&attrs, "toc").map(str::to_string);
                        }
                        b"guide" => section = Section::Guide,
                        _ => {
                            if section == Section::Metadata {
                                capture = Some(Capture {
                                    kind: capture_kind(&local),
                                    attrs: attrs_of(&e),
                                    text: String::new(),
                                    depth: 0,
                                });
                            }
                        }
                    }
                }
                Event::Empty(e) => {
                    let local = e.name().local_name().as_ref().to_vec();
                    let attrs = attrs_of(&e);
                    match section {
                        Section::Metadata => {
                            doc.finish_element(capture_kind(&local), attrs, String::new())
                        }
                        Section::Manifest if local == b"item" => doc.push_manifest_item(&attrs),
                        Section::Spine if local == b"itemref" => {
                            if let Some(idref) = attr(&attrs, "idref") {
                                doc.spine.push(SpineItemRef {
                                    idref: idref.to_string(),
                                });
                            }
                        }
                        Section::Guide if local == b"reference" => {
                            doc.guide.push(GuideReference {
                                ref_type: attr(&attrs, "type").map(str::to_string),
                                href: attr(&attrs, "href").map(str::to_string),
                                title: attr(&attrs, "title").map(str::to_string),
                            });
                        }
                        _ => {}
                    }
                }
                Event::Text(t) => {
                    if let Some(cap) = capture.as_mut() {
                        cap.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(t) => {
                    if let Some(cap) = capture.as_mut() {
                        cap.text
                            .push_str(&String::from_utf8_lossy(t.into_inner().as_ref()));
                    }
                }
                Event::End(e) => {
                    let local = e.name().local_name().as_ref().to_vec();
                    if let Some(cap) = capture.as_mut() {
                        if cap.depth > 0 {
                            cap.depth -= 1;
                            continue;
                        }
                        let finished = capture.take().unwrap();
                        doc.finish_element(finished.kind, finished.attrs, finished.text);
                        continue;
                    }
                    match local.as_slice() {
                        b"metadata" | b"manifest" | b"spine" | b"guide" => {
                            section = Section::None;
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(doc)
    }

    fn push_manifest_item(&mut self, attrs: &[(String, String)]) {
        let (Some(id), Some(href)) = (attr(attrs, "id"), attr(attrs, "href")) else {
            return;
        };
        self.manifest.push(ManifestItem {
            id: id.to_string(),
            href: href.to_string(),
            media_type: attr(attrs, "media-type").map(str::to_string),
            properties: attr(attrs, "properties").map(str::to_string),
        });
    }

    fn finish_element(&mut self, kind: CaptureKind, attrs: Vec<(String, String)>, text: String) {
        match kind {
            CaptureKind::Title => {
                if let Some(text) = non_empty(text) {
                    self.titles.push(OpfTitle {
                        text,
                        id: attr(&attrs, "id").map(str::to_string),
                    });
                }
            }
            CaptureKind::Creator => {
                if let Some(name) = non_empty(text) {
                    self.creators.push(OpfCreator {
                        name,
                        id: attr(&attrs, "id").map(str::to_string),
                        role_attr: attr(&attrs, "role").map(str::to_string),
                        file_as: attr(&attrs, "file-as").map(str::to_string),
                    });
                }
            }
            CaptureKind::Identifier => {
                if let Some(value) = non_empty(text) {
                    self.identifiers.push(OpfIdentifier {
                        scheme: attr(&attrs, "scheme").map(str::to_string),
                        id: attr(&attrs, "id").map(str::to_string),
                        value,
                    });
                }
            }
            CaptureKind::Meta => {
                self.metas.push(OpfMeta {
                    name: attr(&attrs, "name").map(str::to_string),
                    content: attr(&attrs, "content").map(str::to_string),
                    property: attr(&attrs, "property").map(str::to_string),
                    refines: attr(&attrs, "refines").map(str::to_string),
                    id: attr(&attrs, "id").map(str::to_string),
                    text: non_empty(text),
                });
            }
            CaptureKind::Language => {
                if self.language.is_none() {
                    self.language = non_empty(text);
                }
            }
            CaptureKind::Publisher => {
                if self.publisher.is_none() {
                    self.publisher = non_empty(text);
                }
            }
            CaptureKind::Description => {
                if self.description.is_none() {
                    self.description = non_empty(text);
                }
            }
            CaptureKind::Date => {
                if self.date.is_none() {
                    self.date = non_empty(text);
                }
            }
            CaptureKind::Subject => {
                if let Some(subject) = non_empty(text) {
                    self.subjects.push(subject);
                }
            }
            CaptureKind::Other => {}
        }
    }

    /// Value refined onto `target_id` via `<meta refines="#id" property=..>`.
    pub fn refined_property(&self, target_id: &str, property: &str) -> Option<&str> {
        let target = format!("#{target_id}");
        self.metas
            .iter()
            .find(|m| {
                m.refines.as_deref() == Some(target.as_str())
                    && m.property.as_deref() == Some(property)
            })
            .and_then(|m| m.text.as_deref().or(m.content.as_deref()))
    }

    /// First OPF2 `meta name=...` content value.
    pub fn meta_named(&self, name: &str) -> Option<&str> {
        self.metas
            .iter()
            .find(|m| m.name.as_deref() == Some(name))
            .and_then(|m| m.content.as_deref())
    }

    /// Index of the subtitle entry in `titles`: a second `<title>` refined
    /// with `title-type = subtitle`, or one carrying `id="subtitle"`.
    pub fn subtitle_index(&self) -> Option<usize> {
        self.titles.iter().position(|t| {
            t.id.as_deref()
                .map(|id| {
                    id == "subtitle"
                        || self.refined_property(id, "title-type") == Some("subtitle")
                })
                .unwrap_or(false)
        })
    }

    /// The main title: first title that is not the subtitle.
    pub fn main_title(&self) -> Option<&str> {
        let subtitle = self.subtitle_index();
        self.titles
            .iter()
            .enumerate()
            .find(|(i, _)| Some(*i) != subtitle)
            .map(|(_, t)| t.text.as_str())
    }

    /// Effective role of a creator: the `opf:role` attribute, else the
    /// EPUB3 `role` refinement.
    pub fn creator_role(&self, creator: &OpfCreator) -> Option<String> {
        if let Some(role) = &creator.role_attr {
            return Some(role.clone());
        }
        creator
            .id
            .as_deref()
            .and_then(|id| self.refined_property(id, "role"))
            .map(str::to_string)
    }

    pub fn manifest_by_id(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    /// Cover image item: `meta name="cover"` id lookup through the
    /// manifest, else the item with the `cover-image` property.
    pub fn cover_item(&self) -> Option<&ManifestItem> {
        if let Some(id) = self.meta_named("cover") {
            if let Some(item) = self.manifest_by_id(id) {
                return Some(item);
            }
        }
        self.manifest.iter().find(|i| i.has_property("cover-image"))
    }

    /// EPUB3 nav document manifest item.
    pub fn nav_item(&self) -> Option<&ManifestItem> {
        self.manifest.iter().find(|i| i.has_property("nav"))
    }

    /// NCX manifest item, via the spine `toc` attribute or media type.
    pub fn ncx_item(&self) -> Option<&ManifestItem> {
        if let Some(toc) = &self.spine_toc {
            if let Some(item) = self.manifest_by_id(toc) {
                return Some(item);
            }
        }
        self.manifest
            .iter()
            .find(|i| i.media_type.as_deref() == Some("application/x-dtbncx+xml"))
    }
}

fn capture_kind(local: &[u8]) -> CaptureKind {
    match local {
        b"title" => CaptureKind::Title,
        b"creator" => CaptureKind::Creator,
        b"identifier" => CaptureKind::Identifier,
        b"meta" => CaptureKind::Meta,
        b"language" => CaptureKind::Language,
        b"publisher" => CaptureKind::Publisher,
        b"description" => CaptureKind::Description,
        b"date" => CaptureKind::Date,
        b"subject" => CaptureKind::Subject,
        _ => CaptureKind::Other,
    }
}
