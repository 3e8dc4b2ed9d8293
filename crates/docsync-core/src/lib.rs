//! Client-side reconciliation core for docsync.
//!
//! Keeps a locally edited block document consistent with an ordered stream
//! of server transforms while the local user keeps editing.
//!
//! # Coordinate spaces
//!
//! The server addresses blocks by *baseline* position: the index in the
//! structure it last acknowledged. Local edits the server has not seen yet
//! shift local indices away from the baseline. [`Divergences`] records those
//! shifts so a remote position can be mapped to a local index right before
//! the document is mutated.
//!
//! # Pieces
//!
//! - [`ContentBlock`]: identity plus serialized `<w:sdt>` form
//! - [`StateChunk`]: last-synchronized snapshot of one block, with
//!   accept/reject tracked-change rewrites driven by [`markup::RuleSet`]s
//! - [`Package`]: the baseline store, one chunk per server-known block
//! - [`Transform`]: the closed set of remote operations and their dispatch
//! - [`DocumentModel`]: the seam to whatever editor owns the document, with
//!   [`EditScope`] bracketing each mutation
//! - [`BlockDocument`]: in-memory model used by the CLI and tests

mod block;
mod chunk;
mod divergence;
mod document;
mod error;
pub mod ids;
pub mod markup;
mod model;
mod package;
mod transform;

pub use block::ContentBlock;
pub use chunk::StateChunk;
pub use divergence::{Divergence, Divergences};
pub use document::{BlockChange, BlockDocument, DocumentEvent, DOCUMENT_EVENT_CAPACITY};
pub use error::{ApplyError, CoreError, MarkupError, PayloadError};
pub use ids::{BlockId, Seq};
pub use model::{DocumentModel, EditScope};
pub use package::Package;
pub use transform::{ApplyContext, Outcome, Transform, TransformOp, baseline_position};

/// Result type for document and baseline operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: u64, text: &str) -> ContentBlock {
        ContentBlock::from_text(BlockId::new(n), text)
    }

    fn ids(doc: &BlockDocument) -> Vec<u64> {
        doc.block_ids().into_iter().map(BlockId::get).collect()
    }

    #[test]
    fn test_remote_insert_after_local_insert() {
        // Baseline [A, B, C]; local D lands before B.
        let (a, b, c) = (block(1, "A"), block(2, "B"), block(3, "C"));
        let mut package = Package::from_chunks([&a, &b, &c].map(StateChunk::from));
        let mut doc = BlockDocument::from_blocks([a, b, c]).unwrap();
        let mut divergences = Divergences::new();

        doc.insert_block_at(1, block(4, "D")).unwrap();
        divergences.insert(BlockId::new(4), 1);

        // Remote E at baseline 2, after B.
        let e = Transform::new(
            1,
            TransformOp::Insert { position: Some(2), payload: block(5, "E").xml },
        );
        let mut cx = ApplyContext::new(&mut doc, &mut package, &mut divergences);
        assert_eq!(e.apply(&mut cx).unwrap(), Seq::new(1));

        assert_eq!(ids(&doc), vec![1, 4, 2, 5, 3]);
        assert_eq!(doc.full_text(), "A\nD\nB\nE\nC");
    }

    #[test]
    fn test_accept_and_reject_from_same_original() {
        let xml = concat!(
            r#"<w:sdt><w:sdtPr><w:id w:val="1"/></w:sdtPr><w:sdtContent><w:p>"#,
            r#"<w:r><w:t>Hello </w:t></w:r>"#,
            r#"<w:del><w:r><w:delText>world</w:delText></w:r></w:del>"#,
            r#"<w:ins><w:r><w:t>there</w:t></w:r></w:ins>"#,
            r#"</w:p></w:sdtContent></w:sdt>"#,
        );
        let chunk = StateChunk::from(&ContentBlock::parse(xml).unwrap());

        let accepted = chunk.accept_tracked_changes().unwrap();
        let rejected = chunk.reject_tracked_changes().unwrap();
        for out in [&accepted, &rejected] {
            let names: Vec<_> = markup::element_names(out.xml()).collect();
            assert!(!names.iter().any(|n| matches!(*n, "w:ins" | "w:del" | "w:delText")));
        }
        assert_eq!(markup::visible_text(accepted.xml()).unwrap(), "Hello there");
        assert_eq!(markup::visible_text(rejected.xml()).unwrap(), "Hello world");
    }
}
