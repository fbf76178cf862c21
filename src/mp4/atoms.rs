//! iTunes-style metadata atom constants
//!
//! Type codes for the `moov/udta/meta/ilst` subtree, the `data` box payload
//! type registry, and the ID3v1 genre table the `gnre` atom indexes into.

use super::boxes::FourCc;

// Structural boxes
pub const FTYP: FourCc = *b"ftyp";
pub const MOOV: FourCc = *b"moov";
pub const MVHD: FourCc = *b"mvhd";
pub const TRAK: FourCc = *b"trak";
pub const TKHD: FourCc = *b"tkhd";
pub const TREF: FourCc = *b"tref";
pub const CHAP: FourCc = *b"chap";
pub const MDIA: FourCc = *b"mdia";
pub const MDHD: FourCc = *b"mdhd";
pub const HDLR: FourCc = *b"hdlr";
pub const MINF: FourCc = *b"minf";
pub const STBL: FourCc = *b"stbl";
pub const STSD: FourCc = *b"stsd";
pub const STTS: FourCc = *b"stts";
pub const STSZ: FourCc = *b"stsz";
pub const STSC: FourCc = *b"stsc";
pub const STCO: FourCc = *b"stco";
pub const CO64: FourCc = *b"co64";
pub const UDTA: FourCc = *b"udta";
pub const META: FourCc = *b"meta";
pub const ILST: FourCc = *b"ilst";
pub const CHPL: FourCc = *b"chpl";
pub const ESDS: FourCc = *b"esds";
pub const BTRT: FourCc = *b"btrt";
pub const MP4A: FourCc = *b"mp4a";
pub const AC_3: FourCc = *b"ac-3";
pub const EC_3: FourCc = *b"ec-3";

// ilst metadata atoms. The 0xA9 byte is the copyright glyph.
pub const TITLE: FourCc = [0xA9, b'n', b'a', b'm'];
pub const ARTIST: FourCc = [0xA9, b'A', b'R', b'T'];
pub const ALBUM: FourCc = [0xA9, b'a', b'l', b'b'];
pub const GENRE: FourCc = [0xA9, b'g', b'e', b'n'];
pub const DAY: FourCc = [0xA9, b'd', b'a', b'y'];
pub const NARRATOR: FourCc = [0xA9, b'n', b'r', b't'];
pub const COMPOSER: FourCc = [0xA9, b'c', b'm', b'p'];
pub const DESCRIPTION: FourCc = *b"desc";
pub const COVER: FourCc = *b"covr";
pub const MEDIA_TYPE: FourCc = *b"stik";
pub const GENRE_ID: FourCc = *b"gnre";
pub const FREEFORM: FourCc = *b"----";
pub const FREEFORM_MEAN: FourCc = *b"mean";
pub const FREEFORM_NAME: FourCc = *b"name";
pub const DATA: FourCc = *b"data";

// Freeform atom keys, `<mean>:<name>`
pub const FREEFORM_SUBTITLE: &str = "com.apple.iTunes:SUBTITLE";
pub const FREEFORM_ASIN: &str = "com.apple.iTunes:ASIN";
pub const FREEFORM_TAGS: &str = "com.shisho:tags";

/// `stik` value for audiobooks
pub const STIK_AUDIOBOOK: u8 = 2;

/// Payload type code of a `data` box (the 24-bit field after the version
/// byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Implicit/binary
    Implicit,
    Utf8,
    Utf16,
    Jpeg,
    Png,
    /// UTF-8 variant some encoders use for genre atoms. Equivalent to
    /// `Utf8`; rejecting it breaks real-world files.
    Utf8Genre,
    /// Big-endian signed integer of width 1/2/4/8
    BeSigned,
    Bmp,
}

impl DataType {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Implicit),
            1 => Some(Self::Utf8),
            2 => Some(Self::Utf16),
            13 => Some(Self::Jpeg),
            14 => Some(Self::Png),
            18 => Some(Self::Utf8Genre),
            21 => Some(Self::BeSigned),
            27 => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::Implicit => 0,
            Self::Utf8 => 1,
            Self::Utf16 => 2,
            Self::Jpeg => 13,
            Self::Png => 14,
            Self::Utf8Genre => 18,
            Self::BeSigned => 21,
            Self::Bmp => 27,
        }
    }

    /// Whether the payload decodes as UTF-8 text.
    pub fn is_utf8(&self) -> bool {
        matches!(self, Self::Utf8 | Self::Utf8Genre)
    }

    /// Image MIME type for picture payloads.
    pub fn image_mime(&self) -> Option<&'static str> {
        match self {
            Self::Jpeg => Some("image/jpeg"),
            Self::Png => Some("image/png"),
            Self::Bmp => Some("image/bmp"),
            _ => None,
        }
    }

    /// Data type for a cover payload of the given MIME type.
    pub fn for_image_mime(mime: &str) -> Self {
        match mime {
            "image/png" => Self::Png,
            "image/bmp" => Self::Bmp,
            _ => Self::Jpeg,
        }
    }
}

/// ID3v1 genre table (standard list plus the Winamp extensions). The
/// `gnre` atom stores a 1-based index into this table.
pub const ID3V1_GENRES: [&str; 148] = [
    "Blues",
    "Classic Rock",
    "Country",
    "Dance",
    "Disco",
    "Funk",
    "Grunge",
    "Hip-Hop",
    "Jazz",
    "Metal",
    "New Age",
    "Oldies",
    "Other",
    "Pop",
    "R&B",
    "Rap",
    "Reggae",
    "Rock",
    "Techno",
    "Industrial",
    "Alternative",
    "Ska",
    "Death Metal",
    "Pranks",
    "Soundtrack",
    "Euro-Techno",
    "Ambient",
    "Trip-Hop",
    "Vocal",
    "Jazz+Funk",
    "Fusion",
    "Trance",
    "Classical",
    "Instrumental",
    "Acid",
    "House",
    "Game",
    "Sound Clip",
    "Gospel",
    "Noise",
    "AlternRock",
    "Bass",
    "Soul",
    "Punk",
    "Space",
    "Meditative",
    "Instrumental Pop",
    "Instrumental Rock",
    "Ethnic",
    "Gothic",
    "Darkwave",
    "Techno-Industrial",
    "Electronic",
    "Pop-Folk",
    "Eurodance",
    "Dream",
    "Southern Rock",
    "Comedy",
    "Cult",
    "Gangsta",
    "Top 40",
    "Christian Rap",
    "Pop/Funk",
    "Jungle",
    "Native American",
    "Cabaret",
    "New Wave",
    "Psychadelic",
    "Rave",
    "Showtunes",
    "Trailer",
    "Lo-Fi",
    "Tribal",
    "Acid Punk",
    "Acid Jazz",
    "Polka",
    "Retro",
    "Musical",
    "Rock & Roll",
    "Hard Rock",
    "Folk",
    "Folk-Rock",
    "National Folk",
    "Swing",
    "Fast Fusion",
    "Bebob",
    "Latin",
    "Revival",
    "Celtic",
    "Bluegrass",
    "Avantgarde",
    "Gothic Rock",
    "Progressive Rock",
    "Psychedelic Rock",
    "Symphonic Rock",
    "Slow Rock",
    "Big Band",
    "Chorus",
    "Easy Listening",
    "Acoustic",
    "Humour",
    "Speech",
    "Chanson",
    "Opera",
    "Chamber Music",
    "Sonata",
    "Symphony",
    "Booty Bass",
    "Primus",
    "Porn Groove",
    "Satire",
    "Slow Jam",
    "Club",
    "Tango",
    "Samba",
    "Folklore",
    "Ballad",
    "Power Ballad",
    "Rhythmic Soul",
    "Freestyle",
    "Duet",
    "Punk Rock",
    "Drum Solo",
    "A capella",
    "Euro-House",
    "Dance Hall",
    "Goa",
    "Drum & Bass",
    "Club-House",
    "Hardcore",
    "Terror",
    "Indie",
    "BritPop",
    "Negerpunk",
    "Polsk Punk",
    "Beat",
    "Christian Gangsta Rap",
    "Heavy Metal",
    "Black Metal",
    "Crossover",
    "Contemporary Christian",
    "Christian Rock",
    "Merengue",
    "Salsa",
    "Thrash Metal",
    "Anime",
    "Jpop",
    "Synthpop",
];

/// Resolve a 1-based `gnre` index to its genre name.
pub fn genre_by_id(id: u16) -> Option<&'static str> {
    if id == 0 {
        return None;
    }
    ID3V1_GENRES.get((id - 1) as usize).copied()
}
