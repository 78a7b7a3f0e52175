//! Accessors for the parts of the TFLite schema the handler reads.
//!
//! Written in the shape `flatc` generates, but only for the `Model` root
//! table. Nested tables (subgraphs, operator codes, buffers) are verified as
//! tables and otherwise left opaque.

use flatbuffers::{ForwardsUOffset, Follow, InvalidFlatbuffer, Table, Vector, Verifiable, Verifier, VOffsetT};

/// File identifier of the TFLite schema
pub const TFLITE_IDENTIFIER: &str = "TFL3";

/// A table whose fields are never read.
#[derive(Clone, Copy)]
pub struct Opaque<'a> {
    _tab: Table<'a>,
}

impl<'a> Follow<'a> for Opaque<'a> {
    type Inner = Opaque<'a>;

    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        Self { _tab: unsafe { Table::new(buf, loc) } }
    }
}

impl Verifiable for Opaque<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?.finish();
        Ok(())
    }
}

type TableVector<'a> = Vector<'a, ForwardsUOffset<Opaque<'a>>>;

/// `tflite.Model`
#[derive(Clone, Copy)]
pub struct Model<'a> {
    _tab: Table<'a>,
}

impl<'a> Follow<'a> for Model<'a> {
    type Inner = Model<'a>;

    unsafe fn follow(buf: &'a [u8], loc: usize) -> Self::Inner {
        Self { _tab: unsafe { Table::new(buf, loc) } }
    }
}

impl<'a> Model<'a> {
    pub const VT_VERSION: VOffsetT = 4;
    pub const VT_OPERATOR_CODES: VOffsetT = 6;
    pub const VT_SUBGRAPHS: VOffsetT = 8;
    pub const VT_DESCRIPTION: VOffsetT = 10;
    pub const VT_BUFFERS: VOffsetT = 12;

    // The accessors below are only sound on a buffer that passed
    // `Model::run_verifier`, which `root_model` guarantees.

    pub fn version(&self) -> u32 {
        unsafe { self._tab.get::<u32>(Self::VT_VERSION, Some(0)) }.unwrap_or(0)
    }

    pub fn operator_codes(&self) -> Option<TableVector<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<TableVector<'a>>>(Self::VT_OPERATOR_CODES, None) }
    }

    pub fn subgraphs(&self) -> Option<TableVector<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<TableVector<'a>>>(Self::VT_SUBGRAPHS, None) }
    }

    pub fn description(&self) -> Option<&'a str> {
        unsafe { self._tab.get::<ForwardsUOffset<&str>>(Self::VT_DESCRIPTION, None) }
    }

    pub fn buffers(&self) -> Option<TableVector<'a>> {
        unsafe { self._tab.get::<ForwardsUOffset<TableVector<'a>>>(Self::VT_BUFFERS, None) }
    }
}

impl Verifiable for Model<'_> {
    fn run_verifier(v: &mut Verifier, pos: usize) -> Result<(), InvalidFlatbuffer> {
        v.visit_table(pos)?
            .visit_field::<u32>("version", Self::VT_VERSION, false)?
            .visit_field::<ForwardsUOffset<TableVector<'_>>>("operator_codes", Self::VT_OPERATOR_CODES, false)?
            .visit_field::<ForwardsUOffset<TableVector<'_>>>("subgraphs", Self::VT_SUBGRAPHS, false)?
            .visit_field::<ForwardsUOffset<&str>>("description", Self::VT_DESCRIPTION, false)?
            .visit_field::<ForwardsUOffset<TableVector<'_>>>("buffers", Self::VT_BUFFERS, false)?
            .finish();
        Ok(())
    }
}

/// Whether `buf` is long enough to hold a root offset and identifier, and
/// carries `TFL3`.
pub fn has_tflite_identifier(buf: &[u8]) -> bool {
    buf.len() >= 8 && flatbuffers::buffer_has_identifier(buf, TFLITE_IDENTIFIER, false)
}

/// Verifies `buf` and returns its `Model` root.
pub fn root_model(buf: &[u8]) -> Result<Model<'_>, InvalidFlatbuffer> {
    flatbuffers::root::<Model>(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};

    /// A model with two empty subgraphs, one empty buffer and no operator
    /// codes.
    pub(crate) fn sample_model(version: u32, description: &str) -> Vec<u8> {
        fn empty_table(fbb: &mut FlatBufferBuilder<'_>) -> WIPOffset<TableFinishedWIPOffset> {
            let start = fbb.start_table();
            fbb.end_table(start)
        }

        let mut fbb = FlatBufferBuilder::new();
        let subgraphs = [empty_table(&mut fbb), empty_table(&mut fbb)];
        let buffers = [empty_table(&mut fbb)];

        let subgraphs = fbb.create_vector(&subgraphs);
        let buffers = fbb.create_vector(&buffers);
        let description = fbb.create_string(description);

        let start = fbb.start_table();
        fbb.push_slot::<u32>(Model::VT_VERSION, version, 0);
        fbb.push_slot_always(Model::VT_SUBGRAPHS, subgraphs);
        fbb.push_slot_always(Model::VT_DESCRIPTION, description);
        fbb.push_slot_always(Model::VT_BUFFERS, buffers);
        let root = fbb.end_table(start);
        fbb.finish(root, Some(TFLITE_IDENTIFIER));
        fbb.finished_data().to_vec()
    }

    #[test]
    fn reads_model_fields() {
        let buf = sample_model(3, "MLIR Converted.");
        assert!(has_tflite_identifier(&buf));

        let model = root_model(&buf).unwrap();
        assert_eq!(model.version(), 3);
        assert_eq!(model.subgraphs().map(|v| v.len()), Some(2));
        assert_eq!(model.buffers().map(|v| v.len()), Some(1));
        assert!(model.operator_codes().is_none());
        assert_eq!(model.description(), Some("MLIR Converted."));
    }

    #[test]
    fn identifier_check_tolerates_short_input() {
        assert!(!has_tflite_identifier(b"TFL3"));
        assert!(!has_tflite_identifier(&[0u8; 8]));
    }

    #[test]
    fn verifier_rejects_dangling_offsets() {
        let buf = sample_model(3, "converted");
        // Root offset past the end of the buffer.
        let mut broken = buf.clone();
        broken[0..4].copy_from_slice(&(buf.len() as u32 + 64).to_le_bytes());
        assert!(root_model(&broken).is_err());
    }
}
