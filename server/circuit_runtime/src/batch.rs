//! Render batch model and its compact binary codec.
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "RBv1"
//! string table   u32 count, then (u32 len, utf-8 bytes)*
//! components     u32 count, then (u32 component_id, u32 edit count, edit*)*
//! frames         u32 count, then frame*
//! disposed ids   u32 count, then u32*
//! disposed evts  u32 count, then u64*
//! ```
//!
//! Strings in the body are `i32` indexes into the string table, `-1` for none.

use std::collections::HashMap;
use std::io::{Cursor, Read};

use thiserror::Error;

pub const BATCH_MAGIC: [u8; 4] = *b"RBv1";

const NO_INDEX: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch does not start with the expected magic")]
    BadMagic,

    #[error("batch truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("unknown edit kind {0}")]
    UnknownEditKind(u8),

    #[error("string index {index} out of range (table has {len})")]
    StringIndexOutOfRange { index: i32, len: usize },

    #[error("string table entry is not valid utf-8")]
    InvalidUtf8,

    #[error("missing required string for {0}")]
    MissingString(&'static str),

    #[error("{0} trailing bytes after batch body")]
    TrailingBytes(usize),

    #[error("edit references frame {index} but batch has {len} frames")]
    DanglingFrameReference { index: u32, len: usize },

    #[error("frame index {0} is neither absent nor a valid position")]
    InvalidFrameIndex(i32),

    #[error("{0:?} edit requires a reference frame")]
    MissingFrameReference(EditKind),

    #[error("batch section too large: {0}")]
    TooLarge(&'static str),
}

/// A diff of the component tree since the previously committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderBatch {
    pub updated_components: Vec<ComponentDiff>,
    pub reference_frames: Vec<RenderFrame>,
    pub disposed_component_ids: Vec<u32>,
    pub disposed_event_handler_ids: Vec<u64>,
}

impl RenderBatch {
    pub fn is_empty(&self) -> bool {
        self.updated_components.iter().all(|diff| diff.edits.is_empty())
            && self.disposed_component_ids.is_empty()
            && self.disposed_event_handler_ids.is_empty()
    }

    /// Appends a frame to the reference table and returns its index.
    pub fn push_frame(&mut self, frame: RenderFrame) -> u32 {
        self.reference_frames.push(frame);
        (self.reference_frames.len() - 1) as u32
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        let len = self.reference_frames.len();

        for edit in self.updated_components.iter().flat_map(|diff| &diff.edits) {
            match edit.reference_frame_index {
                Some(index) if index as usize >= len => {
                    return Err(BatchError::DanglingFrameReference { index, len });
                }
                None if edit.kind.needs_frame() => {
                    return Err(BatchError::MissingFrameReference(edit.kind));
                }
                _ => {}
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentDiff {
    pub component_id: u32,
    pub edits: Vec<RenderTreeEdit>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKind {
    PrependFrame,
    RemoveFrame,
    SetAttribute,
    RemoveAttribute,
    UpdateText,
    StepIn,
    StepOut,
    UpdateMarkup,
}

impl EditKind {
    fn code(self) -> u8 {
        match self {
            EditKind::PrependFrame => 1,
            EditKind::RemoveFrame => 2,
            EditKind::SetAttribute => 3,
            EditKind::RemoveAttribute => 4,
            EditKind::UpdateText => 5,
            EditKind::StepIn => 6,
            EditKind::StepOut => 7,
            EditKind::UpdateMarkup => 8,
        }
    }

    fn from_code(code: u8) -> Result<Self, BatchError> {
        Ok(match code {
            1 => EditKind::PrependFrame,
            2 => EditKind::RemoveFrame,
            3 => EditKind::SetAttribute,
            4 => EditKind::RemoveAttribute,
            5 => EditKind::UpdateText,
            6 => EditKind::StepIn,
            7 => EditKind::StepOut,
            8 => EditKind::UpdateMarkup,
            other => return Err(BatchError::UnknownEditKind(other)),
        })
    }

    fn needs_frame(self) -> bool {
        matches!(
            self,
            EditKind::PrependFrame
                | EditKind::SetAttribute
                | EditKind::UpdateText
                | EditKind::UpdateMarkup
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTreeEdit {
    pub kind: EditKind,
    pub sibling_index: u32,
    pub reference_frame_index: Option<u32>,
    pub removed_attribute_name: Option<String>,
}

impl RenderTreeEdit {
    fn new(kind: EditKind, sibling_index: u32, reference_frame_index: Option<u32>) -> Self {
        Self {
            kind,
            sibling_index,
            reference_frame_index,
            removed_attribute_name: None,
        }
    }

    pub fn prepend_frame(sibling_index: u32, frame_index: u32) -> Self {
        Self::new(EditKind::PrependFrame, sibling_index, Some(frame_index))
    }

    pub fn remove_frame(sibling_index: u32) -> Self {
        Self::new(EditKind::RemoveFrame, sibling_index, None)
    }

    pub fn set_attribute(sibling_index: u32, frame_index: u32) -> Self {
        Self::new(EditKind::SetAttribute, sibling_index, Some(frame_index))
    }

    pub fn remove_attribute(sibling_index: u32, name: impl Into<String>) -> Self {
        Self {
            removed_attribute_name: Some(name.into()),
            ..Self::new(EditKind::RemoveAttribute, sibling_index, None)
        }
    }

    pub fn update_text(sibling_index: u32, frame_index: u32) -> Self {
        Self::new(EditKind::UpdateText, sibling_index, Some(frame_index))
    }

    pub fn update_markup(sibling_index: u32, frame_index: u32) -> Self {
        Self::new(EditKind::UpdateMarkup, sibling_index, Some(frame_index))
    }

    pub fn step_in(sibling_index: u32) -> Self {
        Self::new(EditKind::StepIn, sibling_index, None)
    }

    pub fn step_out() -> Self {
        Self::new(EditKind::StepOut, 0, None)
    }
}

/// A frame referenced by edits. Event handler id `0` means "no handler".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderFrame {
    Element { name: String, subtree_length: u32 },
    Text { content: String },
    Markup { content: String },
    Attribute {
        name: String,
        value: Option<String>,
        event_handler_id: u64,
    },
    Component { component_id: u32, subtree_length: u32 },
    Region { subtree_length: u32 },
}

impl RenderFrame {
    fn code(&self) -> u8 {
        match self {
            RenderFrame::Element { .. } => 1,
            RenderFrame::Text { .. } => 2,
            RenderFrame::Attribute { .. } => 3,
            RenderFrame::Component { .. } => 4,
            RenderFrame::Region { .. } => 5,
            RenderFrame::Markup { .. } => 6,
        }
    }
}

pub fn encode(batch: &RenderBatch) -> Result<Vec<u8>, BatchError> {
    batch.validate()?;

    let mut writer = BatchWriter::default();
    writer.write_batch(batch)?;
    writer.finish()
}

pub fn decode(bytes: &[u8]) -> Result<RenderBatch, BatchError> {
    let mut reader = BatchReader::new(bytes)?;
    let batch = reader.read_batch()?;
    reader.expect_end()?;
    batch.validate()?;
    Ok(batch)
}

#[derive(Default)]
struct BatchWriter {
    strings: Vec<String>,
    string_index: HashMap<String, i32>,
    body: Vec<u8>,
}

impl BatchWriter {
    fn write_batch(&mut self, batch: &RenderBatch) -> Result<(), BatchError> {
        self.write_len(batch.updated_components.len(), "components")?;
        for diff in &batch.updated_components {
            self.write_u32(diff.component_id);
            self.write_len(diff.edits.len(), "edits")?;
            for edit in &diff.edits {
                self.write_edit(edit)?;
            }
        }

        self.write_len(batch.reference_frames.len(), "frames")?;
        for frame in &batch.reference_frames {
            self.write_frame(frame)?;
        }

        self.write_len(batch.disposed_component_ids.len(), "disposed components")?;
        for id in &batch.disposed_component_ids {
            self.write_u32(*id);
        }

        self.write_len(
            batch.disposed_event_handler_ids.len(),
            "disposed event handlers",
        )?;
        for id in &batch.disposed_event_handler_ids {
            self.body.extend_from_slice(&id.to_le_bytes());
        }

        Ok(())
    }

    fn write_edit(&mut self, edit: &RenderTreeEdit) -> Result<(), BatchError> {
        self.body.push(edit.kind.code());
        self.write_u32(edit.sibling_index);
        let frame_index = match edit.reference_frame_index {
            Some(index) => {
                i32::try_from(index).map_err(|_| BatchError::TooLarge("frame index"))?
            }
            None => NO_INDEX,
        };
        self.write_i32(frame_index);
        self.write_string(edit.removed_attribute_name.as_deref())
    }

    fn write_frame(&mut self, frame: &RenderFrame) -> Result<(), BatchError> {
        self.body.push(frame.code());

        match frame {
            RenderFrame::Element {
                name,
                subtree_length,
            } => {
                self.write_string(Some(name))?;
                self.write_u32(*subtree_length);
            }
            RenderFrame::Text { content } | RenderFrame::Markup { content } => {
                self.write_string(Some(content))?;
            }
            RenderFrame::Attribute {
                name,
                value,
                event_handler_id,
            } => {
                self.write_string(Some(name))?;
                self.write_string(value.as_deref())?;
                self.body.extend_from_slice(&event_handler_id.to_le_bytes());
            }
            RenderFrame::Component {
                component_id,
                subtree_length,
            } => {
                self.write_u32(*component_id);
                self.write_u32(*subtree_length);
            }
            RenderFrame::Region { subtree_length } => self.write_u32(*subtree_length),
        }

        Ok(())
    }

    fn write_string(&mut self, value: Option<&str>) -> Result<(), BatchError> {
        let index = match value {
            None => NO_INDEX,
            Some(value) => match self.string_index.get(value) {
                Some(index) => *index,
                None => {
                    let index = i32::try_from(self.strings.len())
                        .map_err(|_| BatchError::TooLarge("string table"))?;
                    self.strings.push(value.to_string());
                    self.string_index.insert(value.to_string(), index);
                    index
                }
            },
        };

        self.write_i32(index);
        Ok(())
    }

    fn write_len(&mut self, len: usize, section: &'static str) -> Result<(), BatchError> {
        let len = u32::try_from(len).map_err(|_| BatchError::TooLarge(section))?;
        self.write_u32(len);
        Ok(())
    }

    fn write_u32(&mut self, value: u32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn write_i32(&mut self, value: i32) {
        self.body.extend_from_slice(&value.to_le_bytes());
    }

    fn finish(self) -> Result<Vec<u8>, BatchError> {
        let table_len: usize = self.strings.iter().map(|s| 4 + s.len()).sum();
        let mut out = Vec::with_capacity(BATCH_MAGIC.len() + 4 + table_len + self.body.len());

        out.extend_from_slice(&BATCH_MAGIC);
        let count =
            u32::try_from(self.strings.len()).map_err(|_| BatchError::TooLarge("string table"))?;
        out.extend_from_slice(&count.to_le_bytes());

        for value in &self.strings {
            let len = u32::try_from(value.len()).map_err(|_| BatchError::TooLarge("string"))?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        out.extend_from_slice(&self.body);
        Ok(out)
    }
}

struct BatchReader<'a> {
    cursor: Cursor<&'a [u8]>,
    strings: Vec<String>,
}

impl<'a> BatchReader<'a> {
    fn new(bytes: &'a [u8]) -> Result<Self, BatchError> {
        let mut reader = Self {
            cursor: Cursor::new(bytes),
            strings: Vec::new(),
        };

        let mut magic = [0_u8; 4];
        reader.read_exact(&mut magic, "magic")?;
        if magic != BATCH_MAGIC {
            return Err(BatchError::BadMagic);
        }

        let count = reader.read_u32("string table")?;
        for _ in 0..count {
            let len = reader.read_u32("string length")? as usize;
            if len > reader.remaining() {
                return Err(BatchError::Truncated("string"));
            }
            let mut raw = vec![0_u8; len];
            reader.read_exact(&mut raw, "string")?;
            let value = String::from_utf8(raw).map_err(|_| BatchError::InvalidUtf8)?;
            reader.strings.push(value);
        }

        Ok(reader)
    }

    fn read_batch(&mut self) -> Result<RenderBatch, BatchError> {
        let mut batch = RenderBatch::default();

        let components = self.read_u32("component count")?;
        for _ in 0..components {
            let component_id = self.read_u32("component id")?;
            let edit_count = self.read_u32("edit count")?;
            let mut edits = Vec::new();
            for _ in 0..edit_count {
                edits.push(self.read_edit()?);
            }
            batch.updated_components.push(ComponentDiff {
                component_id,
                edits,
            });
        }

        let frames = self.read_u32("frame count")?;
        for _ in 0..frames {
            let frame = self.read_frame()?;
            batch.reference_frames.push(frame);
        }

        let disposed = self.read_u32("disposed component count")?;
        for _ in 0..disposed {
            batch
                .disposed_component_ids
                .push(self.read_u32("disposed component id")?);
        }

        let disposed_handlers = self.read_u32("disposed event handler count")?;
        for _ in 0..disposed_handlers {
            batch
                .disposed_event_handler_ids
                .push(self.read_u64("disposed event handler id")?);
        }

        Ok(batch)
    }

    fn read_edit(&mut self) -> Result<RenderTreeEdit, BatchError> {
        let kind = EditKind::from_code(self.read_u8("edit kind")?)?;
        let sibling_index = self.read_u32("sibling index")?;
        let reference_frame_index = match self.read_i32("frame index")? {
            NO_INDEX => None,
            index => Some(
                u32::try_from(index).map_err(|_| BatchError::InvalidFrameIndex(index))?,
            ),
        };
        let removed_attribute_name = self.read_string("removed attribute name")?;

        Ok(RenderTreeEdit {
            kind,
            sibling_index,
            reference_frame_index,
            removed_attribute_name,
        })
    }

    fn read_frame(&mut self) -> Result<RenderFrame, BatchError> {
        let frame = match self.read_u8("frame kind")? {
            1 => RenderFrame::Element {
                name: self.required_string("element name")?,
                subtree_length: self.read_u32("subtree length")?,
            },
            2 => RenderFrame::Text {
                content: self.required_string("text content")?,
            },
            3 => RenderFrame::Attribute {
                name: self.required_string("attribute name")?,
                value: self.read_string("attribute value")?,
                event_handler_id: self.read_u64("event handler id")?,
            },
            4 => RenderFrame::Component {
                component_id: self.read_u32("component id")?,
                subtree_length: self.read_u32("subtree length")?,
            },
            5 => RenderFrame::Region {
                subtree_length: self.read_u32("subtree length")?,
            },
            6 => RenderFrame::Markup {
                content: self.required_string("markup content")?,
            },
            other => return Err(BatchError::UnknownFrameKind(other)),
        };

        Ok(frame)
    }

    fn required_string(&mut self, what: &'static str) -> Result<String, BatchError> {
        self.read_string(what)?.ok_or(BatchError::MissingString(what))
    }

    fn read_string(&mut self, what: &'static str) -> Result<Option<String>, BatchError> {
        let index = self.read_i32(what)?;
        if index == NO_INDEX {
            return Ok(None);
        }

        usize::try_from(index)
            .ok()
            .and_then(|i| self.strings.get(i))
            .cloned()
            .map(Some)
            .ok_or(BatchError::StringIndexOutOfRange {
                index,
                len: self.strings.len(),
            })
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, BatchError> {
        let mut buf = [0_u8; 1];
        self.read_exact(&mut buf, what)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, BatchError> {
        let mut buf = [0_u8; 4];
        self.read_exact(&mut buf, what)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32(&mut self, what: &'static str) -> Result<i32, BatchError> {
        let mut buf = [0_u8; 4];
        self.read_exact(&mut buf, what)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_u64(&mut self, what: &'static str) -> Result<u64, BatchError> {
        let mut buf = [0_u8; 8];
        self.read_exact(&mut buf, what)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8], what: &'static str) -> Result<(), BatchError> {
        self.cursor
            .read_exact(buf)
            .map_err(|_| BatchError::Truncated(what))
    }

    fn remaining(&self) -> usize {
        let total = self.cursor.get_ref().len();
        total.saturating_sub(self.cursor.position() as usize)
    }

    fn expect_end(&self) -> Result<(), BatchError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(BatchError::TrailingBytes(extra)),
        }
    }
}
