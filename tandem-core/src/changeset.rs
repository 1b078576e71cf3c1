//! Changesets: the operational-transformation algebra for plain text.
//!
//! A changeset describes how to turn a document of `start_len` characters
//! into one of `end_len` characters as a run-length sequence of retained,
//! inserted and deleted characters:
//!
//! ```text
//!   source:   h e l l o
//!   ops:      =2    -2   +1 =1        inserted_text: "y"
//!   result:   h e        y  o
//! ```
//!
//! Three operations make up the algebra:
//!
//! - [`compress`]: canonical form (merged runs, deletes before inserts)
//! - [`compose`]: sequential composition, `A` then `B`
//! - [`follow`]: rebase `B` over a concurrent `A` (the OT transform)
//!
//! Lengths are counted in Unicode scalar values, not bytes.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems" (1989)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single run inside a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "len")]
pub enum Op {
    /// Retain `n` characters of the source document
    #[serde(rename = "=")]
    Equal(usize),
    /// Insert the next `n` characters of the inserted text
    #[serde(rename = "+")]
    Insert(usize),
    /// Remove `n` characters of the source document
    #[serde(rename = "-")]
    Delete(usize),
}

impl Op {
    /// Run length.
    pub fn len(&self) -> usize {
        match *self {
            Op::Equal(n) | Op::Insert(n) | Op::Delete(n) => n,
        }
    }

    /// Zero-length runs never appear in a valid changeset.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same kind of run, new length.
    pub fn with_len(&self, len: usize) -> Op {
        match self {
            Op::Equal(_) => Op::Equal(len),
            Op::Insert(_) => Op::Insert(len),
            Op::Delete(_) => Op::Delete(len),
        }
    }

    /// Characters of the source document this run consumes.
    fn source_len(&self) -> usize {
        match *self {
            Op::Equal(n) | Op::Delete(n) => n,
            Op::Insert(_) => 0,
        }
    }

    /// Characters of the resulting document this run produces.
    fn target_len(&self) -> usize {
        match *self {
            Op::Equal(n) | Op::Insert(n) => n,
            Op::Delete(_) => 0,
        }
    }
}

/// Errors raised by the changeset algebra.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeSetError {
    #[error("cannot compose: first changeset ends at length {left_end}, second starts at {right_start}")]
    ComposeLengthMismatch { left_end: usize, right_start: usize },
    #[error("cannot follow: changesets start at different lengths ({left_start} vs {right_start})")]
    FollowLengthMismatch { left_start: usize, right_start: usize },
    #[error("operation {index} has zero length")]
    ZeroLengthOp { index: usize },
    #[error("operations consume {actual} source characters, expected {expected}")]
    SourceLengthMismatch { expected: usize, actual: usize },
    #[error("operations produce {actual} characters, expected {expected}")]
    TargetLengthMismatch { expected: usize, actual: usize },
    #[error("insert operations cover {expected} characters but inserted text has {actual}")]
    InsertedTextMismatch { expected: usize, actual: usize },
    #[error("changeset applies to a document of length {expected}, got {actual}")]
    BaseLengthMismatch { expected: usize, actual: usize },
    #[error("splice of {removed} characters at offset {offset} exceeds document length {len}")]
    SpliceOutOfRange { offset: usize, removed: usize, len: usize },
}

/// An edit from a document of `start_len` characters to one of `end_len`.
///
/// Fields are private so every value upholds the length invariants:
/// Equal+Delete runs sum to `start_len`, Equal+Insert runs sum to `end_len`,
/// and Insert runs sum to the length of `inserted_text`. Deserialisation
/// goes through the same validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawChangeSet")]
pub struct ChangeSet {
    start_len: usize,
    end_len: usize,
    ops: Vec<Op>,
    inserted_text: String,
}

/// Unvalidated wire shape of a changeset.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeSet {
    start_len: usize,
    end_len: usize,
    ops: Vec<Op>,
    #[serde(default)]
    inserted_text: String,
}

impl TryFrom<RawChangeSet> for ChangeSet {
    type Error = ChangeSetError;

    fn try_from(raw: RawChangeSet) -> Result<Self, Self::Error> {
        ChangeSet::new(raw.start_len, raw.end_len, raw.ops, raw.inserted_text)
    }
}

impl ChangeSet {
    /// Build a changeset, checking every length invariant.
    pub fn new(
        start_len: usize,
        end_len: usize,
        ops: Vec<Op>,
        inserted_text: impl Into<String>,
    ) -> Result<Self, ChangeSetError> {
        let cs = Self {
            start_len,
            end_len,
            ops,
            inserted_text: inserted_text.into(),
        };
        cs.validate()?;
        Ok(cs)
    }

    /// The no-op changeset on a document of `len` characters.
    pub fn identity(len: usize) -> Self {
        let ops = if len > 0 { vec![Op::Equal(len)] } else { Vec::new() };
        Self {
            start_len: len,
            end_len: len,
            ops,
            inserted_text: String::new(),
        }
    }

    /// A changeset that creates `text` from the empty document.
    pub fn from_text(text: &str) -> Self {
        let len = text.chars().count();
        let ops = if len > 0 { vec![Op::Insert(len)] } else { Vec::new() };
        Self {
            start_len: 0,
            end_len: len,
            ops,
            inserted_text: text.to_string(),
        }
    }

    /// Replace `removed` characters at `offset` with `inserted`, on a
    /// document of `doc_len` characters.
    pub fn splice(
        doc_len: usize,
        offset: usize,
        removed: usize,
        inserted: &str,
    ) -> Result<Self, ChangeSetError> {
        let out_of_range = ChangeSetError::SpliceOutOfRange {
            offset,
            removed,
            len: doc_len,
        };
        let end = match offset.checked_add(removed) {
            Some(end) if end <= doc_len => end,
            _ => return Err(out_of_range),
        };

        let mut ops = OpBuilder::default();
        ops.push(Op::Equal(offset));
        ops.push(Op::Delete(removed));
        ops.push(Op::Insert(inserted.chars().count()));
        ops.push(Op::Equal(doc_len - end));

        Ok(Self::from_parts(doc_len, ops.finish(), inserted.to_string()))
    }

    /// Assemble from ops that are known to be consistent, deriving `end_len`.
    fn from_parts(start_len: usize, ops: Vec<Op>, inserted_text: String) -> Self {
        let end_len = ops.iter().map(Op::target_len).sum();
        let cs = Self {
            start_len,
            end_len,
            ops,
            inserted_text,
        };
        debug_assert_eq!(cs.validate(), Ok(()));
        cs
    }

    /// Check the length invariants.
    pub fn validate(&self) -> Result<(), ChangeSetError> {
        if let Some(index) = self.ops.iter().position(Op::is_empty) {
            return Err(ChangeSetError::ZeroLengthOp { index });
        }

        let consumed: usize = self.ops.iter().map(Op::source_len).sum();
        if consumed != self.start_len {
            return Err(ChangeSetError::SourceLengthMismatch {
                expected: self.start_len,
                actual: consumed,
            });
        }

        let produced: usize = self.ops.iter().map(Op::target_len).sum();
        if produced != self.end_len {
            return Err(ChangeSetError::TargetLengthMismatch {
                expected: self.end_len,
                actual: produced,
            });
        }

        let inserted: usize = self
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Insert(n) => Some(*n),
                _ => None,
            })
            .sum();
        let text_len = self.inserted_text.chars().count();
        if inserted != text_len {
            return Err(ChangeSetError::InsertedTextMismatch {
                expected: inserted,
                actual: text_len,
            });
        }

        Ok(())
    }

    pub fn start_len(&self) -> usize {
        self.start_len
    }

    pub fn end_len(&self) -> usize {
        self.end_len
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn inserted_text(&self) -> &str {
        &self.inserted_text
    }

    /// True when applying this changeset never changes a document.
    pub fn is_identity(&self) -> bool {
        self.start_len == self.end_len && self.ops.iter().all(|op| matches!(op, Op::Equal(_)))
    }

    /// The full document text, for changesets based on the empty document.
    ///
    /// Such a changeset is a single insertion, so its inserted text is the
    /// document. Returns `None` for changesets based on a non-empty document.
    pub fn document_text(&self) -> Option<&str> {
        (self.start_len == 0).then_some(self.inserted_text.as_str())
    }

    /// Apply the ops to `base`, walking Equal (copy), Insert (splice in the
    /// next inserted characters) and Delete (skip) runs.
    pub fn apply(&self, base: &str) -> Result<String, ChangeSetError> {
        let base_len = base.chars().count();
        if base_len != self.start_len {
            return Err(ChangeSetError::BaseLengthMismatch {
                expected: self.start_len,
                actual: base_len,
            });
        }

        let mut source = base.chars();
        let mut inserted = self.inserted_text.chars();
        let mut out = String::with_capacity(base.len() + self.inserted_text.len());

        for op in &self.ops {
            match *op {
                Op::Equal(n) => out.extend(source.by_ref().take(n)),
                Op::Insert(n) => out.extend(inserted.by_ref().take(n)),
                Op::Delete(n) => {
                    source.by_ref().take(n).for_each(drop);
                }
            }
        }

        Ok(out)
    }
}

/// Accumulates runs into canonical form.
///
/// Adjacent runs of one kind are merged, zero-length runs are dropped, and
/// within each stretch of edits between two retained runs the deletion is
/// emitted before the insertion.
#[derive(Debug, Default)]
struct OpBuilder {
    ops: Vec<Op>,
    pending_delete: usize,
    pending_insert: usize,
}

impl OpBuilder {
    fn push(&mut self, op: Op) {
        match op {
            Op::Equal(0) | Op::Insert(0) | Op::Delete(0) => {}
            Op::Equal(n) => {
                self.flush();
                match self.ops.last_mut() {
                    Some(Op::Equal(last)) => *last += n,
                    _ => self.ops.push(Op::Equal(n)),
                }
            }
            Op::Insert(n) => self.pending_insert += n,
            Op::Delete(n) => self.pending_delete += n,
        }
    }

    fn flush(&mut self) {
        if self.pending_delete > 0 {
            self.ops.push(Op::Delete(self.pending_delete));
            self.pending_delete = 0;
        }
        if self.pending_insert > 0 {
            self.ops.push(Op::Insert(self.pending_insert));
            self.pending_insert = 0;
        }
    }

    fn finish(mut self) -> Vec<Op> {
        self.flush();
        self.ops
    }
}

/// Merge consecutive runs of the same kind and put each stretch of edits
/// into delete-then-insert order.
///
/// The represented edit and the inserted text are unchanged. Two changesets
/// with the same effect on every document compress to the same value, and
/// `compress(compress(cs)) == compress(cs)`.
pub fn compress(cs: &ChangeSet) -> ChangeSet {
    let mut ops = OpBuilder::default();
    for op in &cs.ops {
        ops.push(*op);
    }
    ChangeSet::from_parts(cs.start_len, ops.finish(), cs.inserted_text.clone())
}

/// Split Equal and Delete runs (and Insert runs when `expand_inserts`) into
/// runs of length one.
///
/// Pure realignment: the result represents the same edit, it is just easier
/// to walk position by position.
pub fn expand(cs: &ChangeSet, expand_inserts: bool) -> ChangeSet {
    let mut ops = Vec::with_capacity(cs.start_len + cs.end_len);
    for op in &cs.ops {
        match op {
            Op::Insert(_) if !expand_inserts => ops.push(*op),
            _ => ops.extend(std::iter::repeat(op.with_len(1)).take(op.len())),
        }
    }
    ChangeSet {
        start_len: cs.start_len,
        end_len: cs.end_len,
        ops,
        inserted_text: cs.inserted_text.clone(),
    }
}

/// Sequential composition: the changeset equivalent to applying `a` and
/// then `b`.
///
/// Requires `a.end_len() == b.start_len()`. The result is compressed.
pub fn compose(a: &ChangeSet, b: &ChangeSet) -> Result<ChangeSet, ChangeSetError> {
    if a.end_len != b.start_len {
        return Err(ChangeSetError::ComposeLengthMismatch {
            left_end: a.end_len,
            right_start: b.start_len,
        });
    }

    let a_ops = expand(a, true).ops;
    let b_ops = expand(b, true).ops;
    let mut a_units = a_ops.into_iter().peekable();
    let mut a_text = a.inserted_text.chars();
    let mut b_text = b.inserted_text.chars();

    let mut out = OpBuilder::default();
    let mut text = String::with_capacity(a.inserted_text.len() + b.inserted_text.len());
    let mut consumed = 0;

    for b_op in b_ops {
        if let Op::Insert(_) = b_op {
            out.push(Op::Insert(1));
            text.extend(b_text.next());
            continue;
        }

        // Characters a removed are invisible to b; they stay removed.
        while let Some(Op::Delete(_)) = a_units.peek() {
            out.push(Op::Delete(1));
            a_units.next();
        }

        let a_op = a_units.next().ok_or(ChangeSetError::SourceLengthMismatch {
            expected: b.start_len,
            actual: consumed,
        })?;
        consumed += 1;

        match (b_op, a_op) {
            (Op::Equal(_), Op::Equal(_)) => out.push(Op::Equal(1)),
            (Op::Equal(_), Op::Insert(_)) => {
                out.push(Op::Insert(1));
                text.extend(a_text.next());
            }
            (Op::Delete(_), Op::Equal(_)) => out.push(Op::Delete(1)),
            // The character only ever existed between a and b.
            (Op::Delete(_), Op::Insert(_)) => {
                a_text.next();
            }
            (Op::Insert(_), _) | (_, Op::Delete(_)) => {
                return Err(ChangeSetError::SourceLengthMismatch {
                    expected: b.start_len,
                    actual: consumed,
                })
            }
        }
    }

    for a_op in a_units {
        match a_op {
            Op::Delete(_) => out.push(Op::Delete(1)),
            Op::Equal(_) | Op::Insert(_) => {
                return Err(ChangeSetError::SourceLengthMismatch {
                    expected: b.start_len,
                    actual: consumed,
                })
            }
        }
    }

    Ok(ChangeSet::from_parts(a.start_len, out.finish(), text))
}

/// Split `cs.inserted_text` into one slice per Insert run.
fn insert_segments(cs: &ChangeSet) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut rest = cs.inserted_text.as_str();
    for op in &cs.ops {
        if let Op::Insert(n) = *op {
            let split = rest.char_indices().nth(n).map_or(rest.len(), |(i, _)| i);
            let (head, tail) = rest.split_at(split);
            segments.push(head);
            rest = tail;
        }
    }
    segments
}

/// Rebase `b` over the concurrent `a`: the changeset that, applied after
/// `a`, carries out the edit `b` made to their common base document.
///
/// Requires `a.start_len() == b.start_len()`. Conflicts resolve as follows:
///
/// - a character survives only if both sides retain it; a delete from
///   either side wins
/// - `a`'s insertions become retained text
/// - `b`'s insertions are kept verbatim; when both sides insert at the same
///   position, the lexically smaller insertion goes first (`a` on a tie)
///
/// With this policy `compose(a, follow(a, b)) == compose(b, follow(b, a))`.
/// The result is compressed and its inserted text is exactly `b`'s.
pub fn follow(a: &ChangeSet, b: &ChangeSet) -> Result<ChangeSet, ChangeSetError> {
    if a.start_len != b.start_len {
        return Err(ChangeSetError::FollowLengthMismatch {
            left_start: a.start_len,
            right_start: b.start_len,
        });
    }

    // Canonical inputs keep every insertion point down to one Insert run.
    let a = expand(&compress(a), false);
    let b = expand(&compress(b), false);
    let a_segments = insert_segments(&a);
    let b_segments = insert_segments(&b);

    let mut out = OpBuilder::default();
    let (mut ai, mut bi) = (0, 0);
    let (mut a_seg, mut b_seg) = (0, 0);

    loop {
        match (a.ops.get(ai).copied(), b.ops.get(bi).copied()) {
            (None, None) => break,
            (Some(Op::Insert(na)), Some(Op::Insert(nb))) => {
                if a_segments[a_seg] <= b_segments[b_seg] {
                    out.push(Op::Equal(na));
                    ai += 1;
                    a_seg += 1;
                } else {
                    out.push(Op::Insert(nb));
                    bi += 1;
                    b_seg += 1;
                }
            }
            (Some(Op::Insert(n)), _) => {
                out.push(Op::Equal(n));
                ai += 1;
                a_seg += 1;
            }
            (_, Some(Op::Insert(n))) => {
                out.push(Op::Insert(n));
                bi += 1;
                b_seg += 1;
            }
            (Some(Op::Equal(_)), Some(Op::Equal(_))) => {
                out.push(Op::Equal(1));
                ai += 1;
                bi += 1;
            }
            (Some(Op::Equal(_)), Some(Op::Delete(_))) => {
                out.push(Op::Delete(1));
                ai += 1;
                bi += 1;
            }
            // Already gone from a's output, whatever b did with it.
            (Some(Op::Delete(_)), Some(Op::Equal(_) | Op::Delete(_))) => {
                ai += 1;
                bi += 1;
            }
            (Some(_), None) | (None, Some(_)) => {
                let consumed = |cs: &ChangeSet, upto: usize| -> usize {
                    cs.ops[..upto].iter().map(Op::source_len).sum()
                };
                return Err(ChangeSetError::SourceLengthMismatch {
                    expected: a.start_len,
                    actual: consumed(&a, ai).min(consumed(&b, bi)),
                });
            }
        }
    }

    Ok(ChangeSet::from_parts(
        a.end_len,
        out.finish(),
        b.inserted_text.clone(),
    ))
}

/// [`compose`], falling back to the identity on `a.end_len()` after logging
/// the precondition violation. For callers that must keep a session alive;
/// the identity is an error signal, not a valid composition.
pub fn compose_or_identity(a: &ChangeSet, b: &ChangeSet) -> ChangeSet {
    compose(a, b).unwrap_or_else(|e| {
        log::error!("Compose failed, substituting identity: {e}");
        ChangeSet::identity(a.end_len)
    })
}

/// [`follow`], falling back to the identity on `a.end_len()` after logging
/// the precondition violation.
pub fn follow_or_identity(a: &ChangeSet, b: &ChangeSet) -> ChangeSet {
    follow(a, b).unwrap_or_else(|e| {
        log::error!("Follow failed, substituting identity: {e}");
        ChangeSet::identity(a.end_len)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn cs(start_len: usize, end_len: usize, ops: Vec<Op>, text: &str) -> ChangeSet {
        ChangeSet::new(start_len, end_len, ops, text).unwrap()
    }

    /// A random canonical changeset on a document of `start_len` characters.
    ///
    /// Inserted characters come from a tiny alphabet so that concurrent
    /// insertions frequently collide.
    fn random_changeset(rng: &mut StdRng, start_len: usize) -> ChangeSet {
        let mut ops = Vec::new();
        let mut text = String::new();
        fn insert(rng: &mut StdRng, ops: &mut Vec<Op>, text: &mut String) {
            if rng.gen_bool(0.3) {
                let n = rng.gen_range(1..=3);
                for _ in 0..n {
                    text.push(['a', 'b', 'c'][rng.gen_range(0..3)]);
                }
                ops.push(Op::Insert(n));
            }
        }
        for _ in 0..start_len {
            insert(rng, &mut ops, &mut text);
            if rng.gen_bool(0.3) {
                ops.push(Op::Delete(1));
            } else {
                ops.push(Op::Equal(1));
            }
        }
        insert(rng, &mut ops, &mut text);
        let end_len = ops.iter().map(Op::target_len).sum();
        compress(&cs(start_len, end_len, ops, &text))
    }

    const DOC: &str = "the quick brown fox";

    #[test]
    fn test_identity_shape() {
        let id = ChangeSet::identity(5);
        assert_eq!(id.ops(), &[Op::Equal(5)]);
        assert!(id.is_identity());
        assert!(id.inserted_text().is_empty());

        let empty = ChangeSet::identity(0);
        assert!(empty.ops().is_empty());
        assert!(empty.is_identity());
    }

    #[test]
    fn test_new_rejects_broken_invariants() {
        assert_eq!(
            ChangeSet::new(2, 2, vec![Op::Equal(0), Op::Equal(2)], ""),
            Err(ChangeSetError::ZeroLengthOp { index: 0 })
        );
        assert_eq!(
            ChangeSet::new(3, 2, vec![Op::Equal(2)], ""),
            Err(ChangeSetError::SourceLengthMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(
            ChangeSet::new(2, 3, vec![Op::Equal(2)], ""),
            Err(ChangeSetError::TargetLengthMismatch { expected: 3, actual: 2 })
        );
        assert_eq!(
            ChangeSet::new(0, 2, vec![Op::Insert(2)], "x"),
            Err(ChangeSetError::InsertedTextMismatch { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_splice() {
        let edit = ChangeSet::splice(5, 1, 2, "XY").unwrap();
        assert_eq!(
            edit.ops(),
            &[Op::Equal(1), Op::Delete(2), Op::Insert(2), Op::Equal(2)]
        );
        assert_eq!(edit.apply("hello").unwrap(), "hXYlo");

        assert!(ChangeSet::splice(5, 4, 2, "").is_err());
        assert!(ChangeSet::splice(5, usize::MAX, 2, "").is_err());
    }

    #[test]
    fn test_apply_rejects_wrong_base() {
        let edit = ChangeSet::splice(5, 0, 0, "!").unwrap();
        assert_eq!(
            edit.apply("hi"),
            Err(ChangeSetError::BaseLengthMismatch { expected: 5, actual: 2 })
        );
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let edit = ChangeSet::splice(3, 1, 1, "ü").unwrap();
        assert_eq!(edit.apply("añb").unwrap(), "aüb");
    }

    #[test]
    fn test_document_text() {
        let doc = ChangeSet::from_text("hello");
        assert_eq!(doc.document_text(), Some("hello"));
        assert_eq!(ChangeSet::identity(3).document_text(), None);
    }

    #[test]
    fn test_compress_merges_runs() {
        let raw = cs(
            4,
            5,
            vec![
                Op::Equal(1),
                Op::Equal(1),
                Op::Insert(1),
                Op::Delete(1),
                Op::Insert(2),
                Op::Delete(1),
            ],
            "xyz",
        );
        let compressed = compress(&raw);
        assert_eq!(
            compressed.ops(),
            &[Op::Equal(2), Op::Delete(2), Op::Insert(3)]
        );
        assert_eq!(compressed.inserted_text(), "xyz");
        assert_eq!(compressed.end_len(), 5);
        assert_eq!(compressed.apply("abcd").unwrap(), raw.apply("abcd").unwrap());
    }

    #[test]
    fn test_compress_idempotent_and_effect_preserving() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let c = random_changeset(&mut rng, DOC.chars().count());
            let expanded = expand(&c, true);
            let once = compress(&expanded);
            assert_eq!(compress(&once), once);
            assert_eq!(once.apply(DOC).unwrap(), expanded.apply(DOC).unwrap());
        }
    }

    #[test]
    fn test_expand() {
        let c = cs(3, 4, vec![Op::Equal(2), Op::Insert(2), Op::Delete(1)], "xy");
        let keep = expand(&c, false);
        assert_eq!(
            keep.ops(),
            &[Op::Equal(1), Op::Equal(1), Op::Insert(2), Op::Delete(1)]
        );
        let all = expand(&c, true);
        assert_eq!(all.ops().len(), 5);
        assert!(all.ops().iter().all(|op| op.len() == 1));
        assert_eq!(compress(&all), c);
    }

    #[test]
    fn test_compose_worked_example() {
        // "01234567" -> "01si7" -> "0esiow"
        let a = cs(
            8,
            5,
            vec![Op::Equal(2), Op::Insert(2), Op::Delete(5), Op::Equal(1)],
            "si",
        );
        let b = cs(
            5,
            6,
            vec![
                Op::Equal(1),
                Op::Insert(1),
                Op::Delete(1),
                Op::Equal(2),
                Op::Delete(1),
                Op::Insert(2),
            ],
            "eow",
        );
        assert_eq!(a.apply("01234567").unwrap(), "01si7");
        assert_eq!(b.apply("01si7").unwrap(), "0esiow");

        let composed = compose(&a, &b).unwrap();
        assert_eq!(
            composed,
            cs(8, 6, vec![Op::Equal(1), Op::Delete(7), Op::Insert(5)], "esiow")
        );
        assert_eq!(composed.apply("01234567").unwrap(), "0esiow");
    }

    #[test]
    fn test_worked_example_short_b_is_malformed() {
        // Retains 3 source characters while claiming a 5-character base.
        let b = ChangeSet::new(
            5,
            6,
            vec![Op::Equal(1), Op::Insert(1), Op::Equal(2), Op::Insert(2)],
            "eow",
        );
        assert_eq!(
            b,
            Err(ChangeSetError::SourceLengthMismatch { expected: 5, actual: 3 })
        );
    }

    #[test]
    fn test_compose_length_mismatch() {
        let a = ChangeSet::identity(3);
        let b = ChangeSet::identity(4);
        assert_eq!(
            compose(&a, &b),
            Err(ChangeSetError::ComposeLengthMismatch { left_end: 3, right_start: 4 })
        );
        assert_eq!(compose_or_identity(&a, &b), ChangeSet::identity(3));
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = ChangeSet::splice(3, 1, 0, "XYZ").unwrap(); // aXYZbc
        let b = ChangeSet::splice(6, 2, 2, "").unwrap(); // aXbc
        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed.inserted_text(), "X");
        assert_eq!(composed.apply("abc").unwrap(), "aXbc");
    }

    #[test]
    fn test_compose_to_empty_document() {
        let a = ChangeSet::splice(5, 1, 2, "xyz").unwrap();
        let b = ChangeSet::splice(6, 0, 6, "").unwrap();
        assert_eq!(b.end_len(), 0);

        let composed = compose(&a, &b).unwrap();
        assert_eq!(composed, cs(5, 0, vec![Op::Delete(5)], ""));
        assert_eq!(composed.apply("hello").unwrap(), "");
    }

    #[test]
    fn test_compose_identity_laws() {
        let mut rng = StdRng::seed_from_u64(11);
        for len in 0..12 {
            let c = random_changeset(&mut rng, len);
            assert_eq!(compose(&ChangeSet::identity(c.start_len()), &c).unwrap(), c);
            assert_eq!(compose(&c, &ChangeSet::identity(c.end_len())).unwrap(), c);
        }
    }

    #[test]
    fn test_compose_matches_sequential_apply() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let a = random_changeset(&mut rng, DOC.chars().count());
            let b = random_changeset(&mut rng, a.end_len());
            let step = b.apply(&a.apply(DOC).unwrap()).unwrap();
            assert_eq!(compose(&a, &b).unwrap().apply(DOC).unwrap(), step);
        }
    }

    #[test]
    fn test_compose_associative() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            let a = random_changeset(&mut rng, 8);
            let b = random_changeset(&mut rng, a.end_len());
            let c = random_changeset(&mut rng, b.end_len());
            let left = compose(&compose(&a, &b).unwrap(), &c).unwrap();
            let right = compose(&a, &compose(&b, &c).unwrap()).unwrap();
            assert_eq!(left, right);
        }
    }

    #[test]
    fn test_follow_length_mismatch() {
        let a = ChangeSet::identity(3);
        let b = ChangeSet::identity(4);
        assert_eq!(
            follow(&a, &b),
            Err(ChangeSetError::FollowLengthMismatch { left_start: 3, right_start: 4 })
        );
        assert_eq!(follow_or_identity(&a, &b), ChangeSet::identity(3));
    }

    #[test]
    fn test_follow_rebases_positions() {
        // Both edit "hello": a prepends "X", b drops the final "o".
        let a = ChangeSet::splice(5, 0, 0, "X").unwrap();
        let b = ChangeSet::splice(5, 4, 1, "").unwrap();

        let b_after_a = follow(&a, &b).unwrap();
        assert_eq!(b_after_a.start_len(), 6);
        assert_eq!(b_after_a.inserted_text(), "");
        assert_eq!(b_after_a.apply("Xhello").unwrap(), "Xhell");

        let a_after_b = follow(&b, &a).unwrap();
        assert_eq!(a_after_b.inserted_text(), "X");
        assert_eq!(a_after_b.apply("hell").unwrap(), "Xhell");
    }

    #[test]
    fn test_follow_delete_wins() {
        // a deletes "ll", b replaces the first "l" with "L".
        let a = ChangeSet::splice(5, 2, 2, "").unwrap();
        let b = ChangeSet::splice(5, 2, 1, "L").unwrap();
        let merged = compose(&a, &follow(&a, &b).unwrap()).unwrap();
        assert_eq!(merged.apply("hello").unwrap(), "heLo");
        assert_eq!(merged, compose(&b, &follow(&b, &a).unwrap()).unwrap());
    }

    #[test]
    fn test_follow_same_position_inserts_tie_break() {
        let a = ChangeSet::splice(2, 1, 0, "b").unwrap();
        let b = ChangeSet::splice(2, 1, 0, "a").unwrap();
        let ab = compose(&a, &follow(&a, &b).unwrap()).unwrap();
        let ba = compose(&b, &follow(&b, &a).unwrap()).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.apply("xy").unwrap(), "xaby");
    }

    #[test]
    fn test_follow_against_identity() {
        let edit = ChangeSet::splice(5, 1, 3, "ZZ").unwrap();
        let id = ChangeSet::identity(5);
        assert_eq!(follow(&id, &edit).unwrap(), edit);
        assert_eq!(follow(&edit, &id).unwrap(), ChangeSet::identity(edit.end_len()));
    }

    #[test]
    fn test_follow_convergence() {
        let mut rng = StdRng::seed_from_u64(42);
        for len in 0..40 {
            let a = random_changeset(&mut rng, len % 10);
            let b = random_changeset(&mut rng, len % 10);
            let ab = compose(&a, &follow(&a, &b).unwrap()).unwrap();
            let ba = compose(&b, &follow(&b, &a).unwrap()).unwrap();
            assert_eq!(ab, ba, "diverged for a={a:?} b={b:?}");
        }
    }

    #[test]
    fn test_follow_keeps_b_text() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..100 {
            let a = random_changeset(&mut rng, 6);
            let b = random_changeset(&mut rng, 6);
            let f = follow(&a, &b).unwrap();
            assert_eq!(f.inserted_text(), b.inserted_text());
            assert_eq!(f.start_len(), a.end_len());
        }
    }

    #[test]
    fn test_json_shape() {
        let edit = ChangeSet::splice(3, 1, 1, "x").unwrap();
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "startLen": 3,
                "endLen": 3,
                "ops": [
                    {"op": "=", "len": 1},
                    {"op": "-", "len": 1},
                    {"op": "+", "len": 1},
                    {"op": "=", "len": 1},
                ],
                "insertedText": "x",
            })
        );
        let back: ChangeSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, edit);
    }

    #[test]
    fn test_json_rejects_invalid_changeset() {
        let json = r#"{"startLen":5,"endLen":6,"ops":[{"op":"=","len":1},{"op":"+","len":1}],"insertedText":"e"}"#;
        assert!(serde_json::from_str::<ChangeSet>(json).is_err());
    }
}
