#![allow(dead_code)]

//! ISO-BMFF box serialization and parsing: the box tree framework, the box
//! set written by the fragmented muxer, a demuxer for progressive MP4
//! files, and the muxer handler.

mod demux;
mod muxer;

#[cfg(test)]
mod test;

pub use demux::*;
pub use muxer::*;

use std::io::Write;
use thiserror::Error;

// Mpeg box type.
pub type BoxType = [u8; 4];

// ImmutableBox is the common trait of boxes.
pub trait ImmutableBox {
    // Type returns the BoxType.
    fn box_type(&self) -> BoxType;

    // Size returns the marshaled size in bytes, header excluded. The size
    // must be known before marshaling since the box header contains it.
    fn size(&self) -> usize;

    // Marshal box to writer.
    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error>;
}

#[derive(Debug, Error)]
pub enum Mp4Error {
    #[error("write: {0}")]
    Write(#[from] std::io::Error),

    #[error("from int: {0} {1}")]
    FromInt(String, std::num::TryFromIntError),

    #[error("parse: {0}")]
    Parse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

// Tree of boxes that can be marshaled together.
pub struct Boxes {
    pub mp4_box: Box<dyn ImmutableBox + Send>,
    pub children: Vec<Boxes>,
}

impl Boxes {
    #[must_use]
    pub fn new<T: ImmutableBox + Send + 'static>(mp4_box: T) -> Self {
        Self {
            mp4_box: Box::new(mp4_box),
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_child(mut self, child: Boxes) -> Self {
        self.children.push(child);
        self
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<Boxes>) -> Self {
        self.children.extend(children);
        self
    }

    // Size returns the total size of the box including children.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = self.mp4_box.size() + 8;
        for child in &self.children {
            total += child.size();
        }
        total
    }

    // Marshal box including children.
    pub fn marshal<W: Write>(&self, w: &mut W) -> Result<(), Mp4Error> {
        let size = self.size();
        write_box_info(w, size, self.mp4_box.box_type())?;

        // The size of an empty box is 8 bytes.
        if size != 8 {
            self.mp4_box.marshal(w)?;
        }
        for child in &self.children {
            child.marshal(w)?;
        }
        Ok(())
    }

    /// Find the total offset of the first direct child with the given type,
    /// relative to the start of this box.
    #[must_use]
    pub fn offset_of_child(&self, box_type: BoxType) -> Option<usize> {
        let mut offset = self.mp4_box.size() + 8;
        for child in &self.children {
            if child.mp4_box.box_type() == box_type {
                return Some(offset);
            }
            offset += child.size();
        }
        None
    }
}

pub fn write_box_info<W: Write>(w: &mut W, size: usize, typ: BoxType) -> Result<(), Mp4Error> {
    w.write_all(
        &u32::try_from(size)
            .map_err(|e| Mp4Error::FromInt("write box info".to_owned(), e))?
            .to_be_bytes(),
    )?;
    w.write_all(&typ)?;
    Ok(())
}

/************************* FullBox **************************/

#[derive(Clone, Copy, Default)]
pub struct FullBox {
    pub version: u8,
    pub flags: [u8; 3],
}

impl FullBox {
    pub fn marshal_field(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&[self.version])?;
        w.write_all(&self.flags)?;
        Ok(())
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
pub fn u32_to_flags(v: u32) -> [u8; 3] {
    [(v >> 16) as u8, (v >> 8) as u8, v as u8]
}

/// Opaque payload with an explicit type, e.g. an 'avcC' configuration blob
/// or a pre-serialized 'pssh' box body.
pub struct RawBox {
    pub typ: BoxType,
    pub data: Vec<u8>,
}

impl ImmutableBox for RawBox {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&self.data)?;
        Ok(())
    }
}

/// A box that is already fully serialized, header included.
pub struct PreSerializedBox {
    pub typ: BoxType,
    pub bytes: Vec<u8>,
}

impl ImmutableBox for PreSerializedBox {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        // Compensate for the header the tree writer adds.
        self.bytes.len().saturating_sub(8)
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&self.bytes[8.min(self.bytes.len())..])?;
        Ok(())
    }
}

/*************************** ftyp / styp ****************************/

pub const TYPE_FTYP: BoxType = *b"ftyp";
pub const TYPE_STYP: BoxType = *b"styp";

pub struct Ftyp {
    pub typ: BoxType,
    pub major_brand: BoxType,
    pub minor_version: u32,
    pub compatible_brands: Vec<BoxType>,
}

impl Ftyp {
    #[must_use]
    pub fn init_segment() -> Self {
        Self {
            typ: TYPE_FTYP,
            major_brand: *b"iso6",
            minor_version: 0,
            compatible_brands: vec![*b"iso6", *b"cmfc", *b"dash"],
        }
    }

    #[must_use]
    pub fn media_segment() -> Self {
        Self {
            typ: TYPE_STYP,
            major_brand: *b"msdh",
            minor_version: 0,
            compatible_brands: vec![*b"msdh", *b"msix"],
        }
    }
}

impl ImmutableBox for Ftyp {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        8 + self.compatible_brands.len() * 4
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&self.major_brand)?;
        w.write_all(&self.minor_version.to_be_bytes())?;
        for brand in &self.compatible_brands {
            w.write_all(brand)?;
        }
        Ok(())
    }
}

/*************************** moov / containers ****************************/

macro_rules! container_box {
    ($name:ident, $typ:literal) => {
        pub struct $name;

        impl ImmutableBox for $name {
            fn box_type(&self) -> BoxType {
                *$typ
            }

            fn size(&self) -> usize {
                0
            }

            fn marshal(&self, _w: &mut dyn Write) -> Result<(), Mp4Error> {
                Ok(())
            }
        }
    };
}

container_box!(Moov, b"moov");
container_box!(Trak, b"trak");
container_box!(Mdia, b"mdia");
container_box!(Minf, b"minf");
container_box!(Stbl, b"stbl");
container_box!(Mvex, b"mvex");
container_box!(Moof, b"moof");
container_box!(Traf, b"traf");
container_box!(Dinf, b"dinf");
container_box!(Sinf, b"sinf");
container_box!(Schi, b"schi");

/*************************** mvhd ****************************/

pub struct Mvhd {
    pub full_box: FullBox,
    pub timescale: u32,
    pub duration: u64,
    pub next_track_id: u32,
}

impl ImmutableBox for Mvhd {
    fn box_type(&self) -> BoxType {
        *b"mvhd"
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            100
        } else {
            112
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if self.full_box.version == 0 {
            w.write_all(&[0; 4])?; // Creation time.
            w.write_all(&[0; 4])?; // Modification time.
            w.write_all(&self.timescale.to_be_bytes())?;
            let duration = u32::try_from(self.duration)
                .map_err(|e| Mp4Error::FromInt("mvhd duration".to_owned(), e))?;
            w.write_all(&duration.to_be_bytes())?;
        } else {
            w.write_all(&[0; 8])?;
            w.write_all(&[0; 8])?;
            w.write_all(&self.timescale.to_be_bytes())?;
            w.write_all(&self.duration.to_be_bytes())?;
        }
        w.write_all(&0x0001_0000_u32.to_be_bytes())?; // Rate 1.0.
        w.write_all(&0x0100_u16.to_be_bytes())?; // Volume 1.0.
        w.write_all(&[0; 2])?; // Reserved.
        w.write_all(&[0; 8])?; // Reserved.
        marshal_unity_matrix(w)?;
        w.write_all(&[0; 24])?; // Pre-defined.
        w.write_all(&self.next_track_id.to_be_bytes())?;
        Ok(())
    }
}

fn marshal_unity_matrix(w: &mut dyn Write) -> Result<(), Mp4Error> {
    w.write_all(&0x0001_0000_u32.to_be_bytes())?;
    w.write_all(&[0; 4])?;
    w.write_all(&[0; 4])?;
    w.write_all(&[0; 4])?;
    w.write_all(&0x0001_0000_u32.to_be_bytes())?;
    w.write_all(&[0; 4])?;
    w.write_all(&[0; 4])?;
    w.write_all(&[0; 4])?;
    w.write_all(&0x4000_0000_u32.to_be_bytes())?;
    Ok(())
}

/*************************** tkhd ****************************/

pub const TKHD_FLAG_ENABLED: u32 = 0x1;
pub const TKHD_FLAG_IN_MOVIE: u32 = 0x2;

pub struct Tkhd {
    pub full_box: FullBox,
    pub track_id: u32,
    pub duration: u64,
    pub volume: u16,
    /// Fixed point 16.16.
    pub width: u32,
    pub height: u32,
}

impl ImmutableBox for Tkhd {
    fn box_type(&self) -> BoxType {
        *b"tkhd"
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            84
        } else {
            96
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if self.full_box.version == 0 {
            w.write_all(&[0; 4])?; // Creation time.
            w.write_all(&[0; 4])?; // Modification time.
            w.write_all(&self.track_id.to_be_bytes())?;
            w.write_all(&[0; 4])?; // Reserved.
            let duration = u32::try_from(self.duration)
                .map_err(|e| Mp4Error::FromInt("tkhd duration".to_owned(), e))?;
            w.write_all(&duration.to_be_bytes())?;
        } else {
            w.write_all(&[0; 8])?;
            w.write_all(&[0; 8])?;
            w.write_all(&self.track_id.to_be_bytes())?;
            w.write_all(&[0; 4])?;
            w.write_all(&self.duration.to_be_bytes())?;
        }
        w.write_all(&[0; 8])?; // Reserved.
        w.write_all(&[0; 2])?; // Layer.
        w.write_all(&[0; 2])?; // Alternate group.
        w.write_all(&self.volume.to_be_bytes())?;
        w.write_all(&[0; 2])?; // Reserved.
        marshal_unity_matrix(w)?;
        w.write_all(&self.width.to_be_bytes())?;
        w.write_all(&self.height.to_be_bytes())?;
        Ok(())
    }
}

/*************************** mdhd ****************************/

pub struct Mdhd {
    pub full_box: FullBox,
    pub timescale: u32,
    pub duration: u64,
    /// ISO 639-2/T code packed as three 5-bit values.
    pub language: [u8; 3],
}

#[must_use]
pub fn pack_language(code: &str) -> [u8; 3] {
    let mut out = [b'u' - 0x60, b'n' - 0x60, b'd' - 0x60];
    let bytes = code.as_bytes();
    if bytes.len() == 3 && bytes.iter().all(u8::is_ascii_lowercase) {
        for (i, b) in bytes.iter().enumerate() {
            out[i] = b - 0x60;
        }
    }
    out
}

impl ImmutableBox for Mdhd {
    fn box_type(&self) -> BoxType {
        *b"mdhd"
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            24
        } else {
            36
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if self.full_box.version == 0 {
            w.write_all(&[0; 4])?;
            w.write_all(&[0; 4])?;
            w.write_all(&self.timescale.to_be_bytes())?;
            let duration = u32::try_from(self.duration)
                .map_err(|e| Mp4Error::FromInt("mdhd duration".to_owned(), e))?;
            w.write_all(&duration.to_be_bytes())?;
        } else {
            w.write_all(&[0; 8])?;
            w.write_all(&[0; 8])?;
            w.write_all(&self.timescale.to_be_bytes())?;
            w.write_all(&self.duration.to_be_bytes())?;
        }
        let lang = (u16::from(self.language[0]) << 10)
            | (u16::from(self.language[1]) << 5)
            | u16::from(self.language[2]);
        w.write_all(&lang.to_be_bytes())?;
        w.write_all(&[0; 2])?; // Pre-defined.
        Ok(())
    }
}

/*************************** hdlr ****************************/

pub struct Hdlr {
    pub full_box: FullBox,
    pub handler_type: BoxType,
    pub name: String,
}

impl Hdlr {
    #[must_use]
    pub fn video() -> Self {
        Self {
            full_box: FullBox::default(),
            handler_type: *b"vide",
            name: "VideoHandler".to_owned(),
        }
    }

    #[must_use]
    pub fn audio() -> Self {
        Self {
            full_box: FullBox::default(),
            handler_type: *b"soun",
            name: "SoundHandler".to_owned(),
        }
    }
}

impl ImmutableBox for Hdlr {
    fn box_type(&self) -> BoxType {
        *b"hdlr"
    }

    fn size(&self) -> usize {
        25 + self.name.len()
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&[0; 4])?; // Pre-defined.
        w.write_all(&self.handler_type)?;
        w.write_all(&[0; 12])?; // Reserved.
        w.write_all(self.name.as_bytes())?;
        w.write_all(&[0])?; // Null terminator.
        Ok(())
    }
}

/*************************** vmhd / smhd ****************************/

pub struct Vmhd;

impl ImmutableBox for Vmhd {
    fn box_type(&self) -> BoxType {
        *b"vmhd"
    }

    fn size(&self) -> usize {
        12
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        FullBox {
            version: 0,
            flags: [0, 0, 1],
        }
        .marshal_field(w)?;
        w.write_all(&[0; 2])?; // Graphics mode.
        w.write_all(&[0; 6])?; // Op color.
        Ok(())
    }
}

pub struct Smhd;

impl ImmutableBox for Smhd {
    fn box_type(&self) -> BoxType {
        *b"smhd"
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        FullBox::default().marshal_field(w)?;
        w.write_all(&[0; 2])?; // Balance.
        w.write_all(&[0; 2])?; // Reserved.
        Ok(())
    }
}

/*************************** dref / url ****************************/

pub struct Dref {
    pub full_box: FullBox,
    pub entry_count: u32,
}

impl ImmutableBox for Dref {
    fn box_type(&self) -> BoxType {
        *b"dref"
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.entry_count.to_be_bytes())?;
        Ok(())
    }
}

pub struct Url {
    pub full_box: FullBox,
}

impl Url {
    /// Media data in the same file as the box.
    #[must_use]
    pub fn self_contained() -> Self {
        Self {
            full_box: FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
        }
    }
}

impl ImmutableBox for Url {
    fn box_type(&self) -> BoxType {
        *b"url "
    }

    fn size(&self) -> usize {
        4
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)
    }
}

/*************************** stsd and sample entries ****************************/

pub struct Stsd {
    pub full_box: FullBox,
    pub entry_count: u32,
}

impl ImmutableBox for Stsd {
    fn box_type(&self) -> BoxType {
        *b"stsd"
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.entry_count.to_be_bytes())?;
        Ok(())
    }
}

/// VisualSampleEntry. Children carry the codec configuration box and, for
/// encrypted tracks, the 'sinf'.
pub struct VisualSampleEntry {
    pub typ: BoxType,
    pub data_reference_index: u16,
    pub width: u16,
    pub height: u16,
}

impl ImmutableBox for VisualSampleEntry {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        78
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&[0; 6])?; // Reserved.
        w.write_all(&self.data_reference_index.to_be_bytes())?;
        w.write_all(&[0; 2])?; // Pre-defined.
        w.write_all(&[0; 2])?; // Reserved.
        w.write_all(&[0; 12])?; // Pre-defined.
        w.write_all(&self.width.to_be_bytes())?;
        w.write_all(&self.height.to_be_bytes())?;
        w.write_all(&0x0048_0000_u32.to_be_bytes())?; // Horiz resolution 72 dpi.
        w.write_all(&0x0048_0000_u32.to_be_bytes())?; // Vert resolution 72 dpi.
        w.write_all(&[0; 4])?; // Reserved.
        w.write_all(&1_u16.to_be_bytes())?; // Frame count.
        w.write_all(&[0; 32])?; // Compressor name.
        w.write_all(&0x0018_u16.to_be_bytes())?; // Depth.
        w.write_all(&(-1_i16).to_be_bytes())?; // Pre-defined.
        Ok(())
    }
}

/// AudioSampleEntry.
pub struct AudioSampleEntry {
    pub typ: BoxType,
    pub data_reference_index: u16,
    pub channel_count: u16,
    pub sample_size: u16,
    /// Fixed point 16.16.
    pub sample_rate: u32,
}

impl ImmutableBox for AudioSampleEntry {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        28
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&[0; 6])?; // Reserved.
        w.write_all(&self.data_reference_index.to_be_bytes())?;
        w.write_all(&[0; 8])?; // Reserved.
        w.write_all(&self.channel_count.to_be_bytes())?;
        w.write_all(&self.sample_size.to_be_bytes())?;
        w.write_all(&[0; 4])?; // Pre-defined, reserved.
        w.write_all(&self.sample_rate.to_be_bytes())?;
        Ok(())
    }
}

/*************************** empty sample tables ****************************/

/// stts, stsc, stco and stsz with no entries, as a fragmented init segment
/// carries them.
pub struct EmptyTable {
    pub typ: BoxType,
}

impl ImmutableBox for EmptyTable {
    fn box_type(&self) -> BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        if self.typ == *b"stsz" {
            12
        } else {
            8
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        FullBox::default().marshal_field(w)?;
        if self.typ == *b"stsz" {
            w.write_all(&[0; 4])?; // Sample size.
        }
        w.write_all(&[0; 4])?; // Entry count.
        Ok(())
    }
}

/*************************** mvex / trex ****************************/

pub struct Trex {
    pub full_box: FullBox,
    pub track_id: u32,
}

impl ImmutableBox for Trex {
    fn box_type(&self) -> BoxType {
        *b"trex"
    }

    fn size(&self) -> usize {
        24
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.track_id.to_be_bytes())?;
        w.write_all(&1_u32.to_be_bytes())?; // Default sample description index.
        w.write_all(&[0; 4])?; // Default sample duration.
        w.write_all(&[0; 4])?; // Default sample size.
        w.write_all(&[0; 4])?; // Default sample flags.
        Ok(())
    }
}

/*************************** protection boxes ****************************/

pub struct Frma {
    pub data_format: BoxType,
}

impl ImmutableBox for Frma {
    fn box_type(&self) -> BoxType {
        *b"frma"
    }

    fn size(&self) -> usize {
        4
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        w.write_all(&self.data_format)?;
        Ok(())
    }
}

pub struct Schm {
    pub full_box: FullBox,
    pub scheme_type: BoxType,
    pub scheme_version: u32,
}

impl ImmutableBox for Schm {
    fn box_type(&self) -> BoxType {
        *b"schm"
    }

    fn size(&self) -> usize {
        12
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.scheme_type)?;
        w.write_all(&self.scheme_version.to_be_bytes())?;
        Ok(())
    }
}

pub struct Tenc {
    pub full_box: FullBox,
    pub crypt_byte_block: u8,
    pub skip_byte_block: u8,
    pub default_is_protected: u8,
    pub default_per_sample_iv_size: u8,
    pub default_kid: [u8; 16],
    pub default_constant_iv: Vec<u8>,
}

impl ImmutableBox for Tenc {
    fn box_type(&self) -> BoxType {
        *b"tenc"
    }

    fn size(&self) -> usize {
        let mut size = 24;
        if self.default_per_sample_iv_size == 0 {
            size += 1 + self.default_constant_iv.len();
        }
        size
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&[0])?; // Reserved.
        if self.full_box.version == 0 {
            w.write_all(&[0])?; // Reserved.
        } else {
            w.write_all(&[(self.crypt_byte_block << 4) | (self.skip_byte_block & 0x0f)])?;
        }
        w.write_all(&[self.default_is_protected])?;
        w.write_all(&[self.default_per_sample_iv_size])?;
        w.write_all(&self.default_kid)?;
        if self.default_per_sample_iv_size == 0 {
            let iv_size = u8::try_from(self.default_constant_iv.len())
                .map_err(|e| Mp4Error::FromInt("constant iv size".to_owned(), e))?;
            w.write_all(&[iv_size])?;
            w.write_all(&self.default_constant_iv)?;
        }
        Ok(())
    }
}

/*************************** moof boxes ****************************/

pub struct Mfhd {
    pub full_box: FullBox,
    pub sequence_number: u32,
}

impl ImmutableBox for Mfhd {
    fn box_type(&self) -> BoxType {
        *b"mfhd"
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.sequence_number.to_be_bytes())?;
        Ok(())
    }
}

pub const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x20000;

pub struct Tfhd {
    pub full_box: FullBox,
    pub track_id: u32,
}

impl ImmutableBox for Tfhd {
    fn box_type(&self) -> BoxType {
        *b"tfhd"
    }

    fn size(&self) -> usize {
        8
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.track_id.to_be_bytes())?;
        Ok(())
    }
}

pub struct Tfdt {
    pub full_box: FullBox,
    pub base_media_decode_time: u64,
}

impl ImmutableBox for Tfdt {
    fn box_type(&self) -> BoxType {
        *b"tfdt"
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            8
        } else {
            12
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        if self.full_box.version == 0 {
            let time = u32::try_from(self.base_media_decode_time)
                .map_err(|e| Mp4Error::FromInt("base media decode time".to_owned(), e))?;
            w.write_all(&time.to_be_bytes())?;
        } else {
            w.write_all(&self.base_media_decode_time.to_be_bytes())?;
        }
        Ok(())
    }
}

pub const TRUN_DATA_OFFSET_PRESENT: u32 = 0x1;
pub const TRUN_SAMPLE_DURATION_PRESENT: u32 = 0x100;
pub const TRUN_SAMPLE_SIZE_PRESENT: u32 = 0x200;
pub const TRUN_SAMPLE_FLAGS_PRESENT: u32 = 0x400;
pub const TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT: u32 = 0x800;

pub const SAMPLE_FLAG_IS_NON_SYNC: u32 = 1 << 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrunEntry {
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_flags: u32,
    pub sample_composition_time_offset: i32,
}

pub struct Trun {
    pub full_box: FullBox,
    pub data_offset: i32,
    pub entries: Vec<TrunEntry>,
}

impl Trun {
    #[must_use]
    pub fn flags() -> [u8; 3] {
        u32_to_flags(
            TRUN_DATA_OFFSET_PRESENT
                | TRUN_SAMPLE_DURATION_PRESENT
                | TRUN_SAMPLE_SIZE_PRESENT
                | TRUN_SAMPLE_FLAGS_PRESENT
                | TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
        )
    }
}

impl ImmutableBox for Trun {
    fn box_type(&self) -> BoxType {
        *b"trun"
    }

    fn size(&self) -> usize {
        12 + self.entries.len() * 16
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        let count = u32::try_from(self.entries.len())
            .map_err(|e| Mp4Error::FromInt("trun entry count".to_owned(), e))?;
        w.write_all(&count.to_be_bytes())?;
        w.write_all(&self.data_offset.to_be_bytes())?;
        for entry in &self.entries {
            w.write_all(&entry.sample_duration.to_be_bytes())?;
            w.write_all(&entry.sample_size.to_be_bytes())?;
            w.write_all(&entry.sample_flags.to_be_bytes())?;
            w.write_all(&entry.sample_composition_time_offset.to_be_bytes())?;
        }
        Ok(())
    }
}

/*************************** senc / saiz / saio ****************************/

pub const SENC_SUBSAMPLE_FLAG: u32 = 0x2;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SencEntry {
    pub iv: Vec<u8>,
    /// (clear, cipher) pairs; empty when the sample has no subsamples.
    pub subsamples: Vec<(u16, u32)>,
}

impl SencEntry {
    fn size(&self, has_subsamples: bool) -> usize {
        let mut size = self.iv.len();
        if has_subsamples {
            size += 2 + self.subsamples.len() * 6;
        }
        size
    }
}

pub struct Senc {
    pub full_box: FullBox,
    pub entries: Vec<SencEntry>,
}

impl Senc {
    fn has_subsamples(&self) -> bool {
        self.full_box.flags[2] & 0x2 != 0
    }

    /// Size of the sample auxiliary information for each entry, as saiz
    /// reports it.
    #[must_use]
    pub fn entry_sizes(&self) -> Vec<u8> {
        let has_subsamples = self.has_subsamples();
        self.entries
            .iter()
            .map(|e| u8::try_from(e.size(has_subsamples)).unwrap_or(u8::MAX))
            .collect()
    }
}

impl ImmutableBox for Senc {
    fn box_type(&self) -> BoxType {
        *b"senc"
    }

    fn size(&self) -> usize {
        let has_subsamples = self.has_subsamples();
        8 + self
            .entries
            .iter()
            .map(|e| e.size(has_subsamples))
            .sum::<usize>()
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        let count = u32::try_from(self.entries.len())
            .map_err(|e| Mp4Error::FromInt("senc entry count".to_owned(), e))?;
        w.write_all(&count.to_be_bytes())?;
        let has_subsamples = self.has_subsamples();
        for entry in &self.entries {
            w.write_all(&entry.iv)?;
            if has_subsamples {
                let count = u16::try_from(entry.subsamples.len())
                    .map_err(|e| Mp4Error::FromInt("subsample count".to_owned(), e))?;
                w.write_all(&count.to_be_bytes())?;
                for (clear, cipher) in &entry.subsamples {
                    w.write_all(&clear.to_be_bytes())?;
                    w.write_all(&cipher.to_be_bytes())?;
                }
            }
        }
        Ok(())
    }
}

pub struct Saiz {
    pub full_box: FullBox,
    pub default_sample_info_size: u8,
    pub sample_count: u32,
    /// Per-sample sizes, used when the default is 0.
    pub sample_info_sizes: Vec<u8>,
}

impl ImmutableBox for Saiz {
    fn box_type(&self) -> BoxType {
        *b"saiz"
    }

    fn size(&self) -> usize {
        let mut size = 9;
        if self.default_sample_info_size == 0 {
            size += self.sample_info_sizes.len();
        }
        size
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&[self.default_sample_info_size])?;
        w.write_all(&self.sample_count.to_be_bytes())?;
        if self.default_sample_info_size == 0 {
            w.write_all(&self.sample_info_sizes)?;
        }
        Ok(())
    }
}

pub struct Saio {
    pub full_box: FullBox,
    /// Offset of the first senc entry, relative to the moof start.
    pub offset: u64,
}

impl ImmutableBox for Saio {
    fn box_type(&self) -> BoxType {
        *b"saio"
    }

    fn size(&self) -> usize {
        12
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&1_u32.to_be_bytes())?; // Entry count.
        let offset = u32::try_from(self.offset)
            .map_err(|e| Mp4Error::FromInt("saio offset".to_owned(), e))?;
        w.write_all(&offset.to_be_bytes())?;
        Ok(())
    }
}

/*************************** sidx ****************************/

pub struct Sidx {
    pub full_box: FullBox,
    pub reference_id: u32,
    pub timescale: u32,
    pub earliest_presentation_time: u64,
    pub referenced_size: u32,
    pub subsegment_duration: u32,
    pub starts_with_sap: bool,
}

impl ImmutableBox for Sidx {
    fn box_type(&self) -> BoxType {
        *b"sidx"
    }

    fn size(&self) -> usize {
        if self.full_box.version == 0 {
            36
        } else {
            44
        }
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        self.full_box.marshal_field(w)?;
        w.write_all(&self.reference_id.to_be_bytes())?;
        w.write_all(&self.timescale.to_be_bytes())?;
        if self.full_box.version == 0 {
            let time = u32::try_from(self.earliest_presentation_time)
                .map_err(|e| Mp4Error::FromInt("earliest presentation time".to_owned(), e))?;
            w.write_all(&time.to_be_bytes())?;
            w.write_all(&[0; 4])?; // First offset.
        } else {
            w.write_all(&self.earliest_presentation_time.to_be_bytes())?;
            w.write_all(&[0; 8])?;
        }
        w.write_all(&[0; 2])?; // Reserved.
        w.write_all(&1_u16.to_be_bytes())?; // Reference count.
        w.write_all(&(self.referenced_size & 0x7fff_ffff).to_be_bytes())?;
        w.write_all(&self.subsegment_duration.to_be_bytes())?;
        let sap = if self.starts_with_sap {
            0x9000_0000_u32
        } else {
            0
        };
        w.write_all(&sap.to_be_bytes())?;
        Ok(())
    }
}

/*************************** mdat ****************************/

pub const TYPE_MDAT: BoxType = *b"mdat";

/// Media payloads, referenced without copying.
pub struct Mdat {
    pub payloads: Vec<bytes::Bytes>,
}

impl ImmutableBox for Mdat {
    fn box_type(&self) -> BoxType {
        TYPE_MDAT
    }

    fn size(&self) -> usize {
        self.payloads.iter().map(bytes::Bytes::len).sum()
    }

    fn marshal(&self, w: &mut dyn Write) -> Result<(), Mp4Error> {
        for payload in &self.payloads {
            w.write_all(payload)?;
        }
        Ok(())
    }
}
