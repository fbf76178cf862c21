//! ComicInfo.xml model
//!
//! Serde model of the Anansi-Project schema subset the catalog tracks,
//! plus common passthrough fields so a rewrite does not strip them.

use serde::{Deserialize, Serialize};

/// ComicInfo.xml document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename = "ComicInfo")]
pub struct ComicInfo {
    #[serde(rename = "Title", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(rename = "Series", skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,

    #[serde(rename = "Number", skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,

    #[serde(rename = "Count", skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    #[serde(rename = "Volume", skip_serializing_if = "Option::is_none")]
    pub volume: Option<i32>,

    #[serde(rename = "Summary", skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(rename = "Notes", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(rename = "Year", skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,

    #[serde(rename = "Month", skip_serializing_if = "Option::is_none")]
    pub month: Option<u32>,

    #[serde(rename = "Day", skip_serializing_if = "Option::is_none")]
    pub day: Option<u32>,

    #[serde(rename = "Writer", skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,

    #[serde(rename = "Penciller", skip_serializing_if = "Option::is_none")]
    pub penciller: Option<String>,

    #[serde(rename = "Inker", skip_serializing_if = "Option::is_none")]
    pub inker: Option<String>,

    #[serde(rename = "Colorist", skip_serializing_if = "Option::is_none")]
    pub colorist: Option<String>,

    #[serde(rename = "Letterer", skip_serializing_if = "Option::is_none")]
    pub letterer: Option<String>,

    #[serde(rename = "CoverArtist", skip_serializing_if = "Option::is_none")]
    pub cover_artist: Option<String>,

    #[serde(rename = "Editor", skip_serializing_if = "Option::is_none")]
    pub editor: Option<String>,

    #[serde(rename = "Translator", skip_serializing_if = "Option::is_none")]
    pub translator: Option<String>,

    #[serde(rename = "Publisher", skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(rename = "Imprint", skip_serializing_if = "Option::is_none")]
    pub imprint: Option<String>,

    #[serde(rename = "Genre", skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,

    #[serde(rename = "Tags", skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,

    #[serde(rename = "Web", skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,

    #[serde(rename = "PageCount", skip_serializing_if = "Option::is_none")]
    pub page_count: Option<u32>,

    #[serde(rename = "LanguageISO", skip_serializing_if = "Option::is_none")]
    pub language_iso: Option<String>,

    #[serde(rename = "Format", skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(rename = "AgeRating", skip_serializing_if = "Option::is_none")]
    pub age_rating: Option<String>,

    #[serde(rename = "GTIN", skip_serializing_if = "Option::is_none")]
    pub gtin: Option<String>,

    #[serde(rename = "Pages", skip_serializing_if = "Option::is_none")]
    pub pages: Option<Pages>,
}

pub const PAGE_TYPE_FRONT_COVER: &str = "FrontCover";

/// `Pages` child holding per-page records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pages {
    #[serde(rename = "Page", default)]
    pub pages: Vec<PageInfo>,
}

/// One `Page` record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageInfo {
    /// 0-indexed page number
    #[serde(rename = "@Image")]
    pub image: u32,

    #[serde(rename = "@Type", skip_serializing_if = "Option::is_none")]
    pub page_type: Option<String>,

    #[serde(rename = "@DoublePage", skip_serializing_if = "Option::is_none")]
    pub double_page: Option<bool>,

    #[serde(rename = "@ImageSize", skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u64>,

    #[serde(rename = "@ImageWidth", skip_serializing_if = "Option::is_none")]
    pub image_width: Option<i32>,

    #[serde(rename = "@ImageHeight", skip_serializing_if = "Option::is_none")]
    pub image_height: Option<i32>,
}

impl ComicInfo {
    pub fn parse(xml: &str) -> Result<Self, quick_xml::DeError> {
        quick_xml::de::from_str(xml)
    }

    pub fn to_xml(&self) -> Result<String, quick_xml::DeError> {
        let body = quick_xml::se::to_string(self)?;
        Ok(format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{body}"))
    }

    /// 0-indexed front-cover page, from the `Pages` records.
    pub fn front_cover_page(&self) -> Option<u32> {
        self.pages.as_ref().and_then(|pages| {
            pages
                .pages
                .iter()
                .find(|p| p.page_type.as_deref() == Some(PAGE_TYPE_FRONT_COVER))
                .map(|p| p.image)
        })
    }

    /// Mark `page` as the front cover: strip the attribute from every other
    /// record, then tag the matching record, creating a minimal one if no
    /// record for that page exists.
    pub fn set_front_cover(&mut self, page: u32) {
        let pages = self.pages.get_or_insert_with(Pages::default);
        for record in &mut pages.pages {
            if record.page_type.as_deref() == Some(PAGE_TYPE_FRONT_COVER) {
                record.page_type = None;
            }
        }
        match pages.pages.iter_mut().find(|p| p.image == page) {
            Some(record) => record.page_type = Some(PAGE_TYPE_FRONT_COVER.to_string()),
            None => pages.pages.push(PageInfo {
                image: page,
                page_type: Some(PAGE_TYPE_FRONT_COVER.to_string()),
                ..Default::default()
            }),
        }
    }
}
