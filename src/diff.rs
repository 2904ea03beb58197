//! Line-level diffs between two byte strings.
//!
//! Lines are split on `\n` only, over raw bytes, so content that isn't UTF-8 diffs fine, and two
//! inputs produce an empty diff exactly when they are byte-for-byte identical.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpanKind {
	Added,
	Removed,
	/// Lines replaced in place: a run of removals immediately followed by additions.
	Modified,
}

/// A contiguous run of changed lines.  Line numbers are 1-based; for an insertion, `old_start`
/// is the line the new text lands before (and `old_len` is zero), and vice versa for a removal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiffSpan {
	pub kind: SpanKind,
	pub old_start: usize,
	pub old_lines: Vec<Vec<u8>>,
	pub new_start: usize,
	pub new_lines: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineDiff {
	pub spans: Vec<DiffSpan>,
	/// Lines only in the new text.
	pub added: usize,
	/// Lines only in the old text.
	pub removed: usize,
	/// Lines changed in place (counted once per replaced pair).
	pub modified: usize,
}

impl LineDiff {
	pub fn is_empty(&self) -> bool {
		self.spans.is_empty()
	}
}

fn split_lines(b: &[u8]) -> Vec<&[u8]> {
	b.split(|c| *c == b'\n').collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Op {
	Keep,
	Del,
	Ins,
}

/// Compute the line diff that turns `old` into `new`.
pub fn diff_lines(old: &[u8], new: &[u8]) -> LineDiff {
	let a = split_lines(old);
	let b = split_lines(new);

	// Trim the common ends first; edits are usually small relative to the document
	let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
	let suffix = a[prefix..]
		.iter()
		.rev()
		.zip(b[prefix..].iter().rev())
		.take_while(|(x, y)| x == y)
		.count();

	let a_mid = &a[prefix..a.len() - suffix];
	let b_mid = &b[prefix..b.len() - suffix];

	let ops = lcs_ops(a_mid, b_mid);

	collect_spans(&ops, a_mid, b_mid, prefix)
}

/// Edit script along a longest common subsequence.
///
/// Hirschberg's divide and conquer: only two rows of the LCS table are ever live, so memory
/// stays linear in the input however little the two sides have in common.
fn lcs_ops(a: &[&[u8]], b: &[&[u8]]) -> Vec<Op> {
	let mut ops = Vec::with_capacity(a.len() + b.len());
	split_ops(a, b, &mut ops);
	ops
}

fn split_ops(a: &[&[u8]], b: &[&[u8]], ops: &mut Vec<Op>) {
	if a.is_empty() {
		ops.extend(std::iter::repeat_n(Op::Ins, b.len()));
		return;
	}
	if b.is_empty() {
		ops.extend(std::iter::repeat_n(Op::Del, a.len()));
		return;
	}

	if let [line] = a {
		match b.iter().position(|l| l == line) {
			Some(j) => {
				ops.extend(std::iter::repeat_n(Op::Ins, j));
				ops.push(Op::Keep);
				ops.extend(std::iter::repeat_n(Op::Ins, b.len() - j - 1));
			}
			None => {
				ops.push(Op::Del);
				ops.extend(std::iter::repeat_n(Op::Ins, b.len()));
			}
		}
		return;
	}

	let mid = a.len() / 2;
	let head = lcs_row(&a[..mid], b);
	let tail = lcs_row_rev(&a[mid..], b);

	// First column where an optimal path crosses the middle row
	let mut split = 0;
	for j in 1..=b.len() {
		if head[j] + tail[j] > head[split] + tail[split] {
			split = j;
		}
	}

	split_ops(&a[..mid], &b[..split], ops);
	split_ops(&a[mid..], &b[split..], ops);
}

/// `row[j]` is the LCS length of `a` and `b[..j]`.
fn lcs_row(a: &[&[u8]], b: &[&[u8]]) -> Vec<u32> {
	let mut prev = vec![0u32; b.len() + 1];
	let mut cur = vec![0u32; b.len() + 1];

	for x in a {
		for (j, y) in b.iter().enumerate() {
			cur[j + 1] = if x == y {
				prev[j] + 1
			} else {
				cur[j].max(prev[j + 1])
			};
		}
		std::mem::swap(&mut prev, &mut cur);
	}

	prev
}

/// `row[j]` is the LCS length of `a` and `b[j..]`.
fn lcs_row_rev(a: &[&[u8]], b: &[&[u8]]) -> Vec<u32> {
	let mut prev = vec![0u32; b.len() + 1];
	let mut cur = vec![0u32; b.len() + 1];

	for x in a.iter().rev() {
		for j in (0..b.len()).rev() {
			cur[j] = if *x == b[j] {
				prev[j + 1] + 1
			} else {
				cur[j + 1].max(prev[j])
			};
		}
		std::mem::swap(&mut prev, &mut cur);
	}

	prev
}

fn collect_spans(ops: &[Op], a: &[&[u8]], b: &[&[u8]], offset: usize) -> LineDiff {
	let mut diff = LineDiff::default();
	let (mut i, mut j) = (0usize, 0usize);
	let mut k = 0;

	while k < ops.len() {
		if ops[k] == Op::Keep {
			i += 1;
			j += 1;
			k += 1;
			continue;
		}

		// A maximal run of non-Keep ops is one span
		let (start_i, start_j) = (i, j);
		while k < ops.len() && ops[k] != Op::Keep {
			match ops[k] {
				Op::Del => i += 1,
				Op::Ins => j += 1,
				Op::Keep => unreachable!(),
			}
			k += 1;
		}

		let old_lines: Vec<Vec<u8>> = a[start_i..i].iter().map(|l| l.to_vec()).collect();
		let new_lines: Vec<Vec<u8>> = b[start_j..j].iter().map(|l| l.to_vec()).collect();

		let kind = match (old_lines.len(), new_lines.len()) {
			(_, 0) => SpanKind::Removed,
			(0, _) => SpanKind::Added,
			_ => SpanKind::Modified,
		};

		let paired = old_lines.len().min(new_lines.len());
		diff.modified += paired;
		diff.removed += old_lines.len() - paired;
		diff.added += new_lines.len() - paired;

		diff.spans.push(DiffSpan {
			kind,
			old_start: offset + start_i + 1,
			old_lines,
			new_start: offset + start_j + 1,
			new_lines,
		});
	}

	diff
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identical_is_empty() {
		let d = diff_lines(b"a\nb\nc", b"a\nb\nc");

		assert!(d.is_empty());
		assert_eq!((0, 0, 0), (d.added, d.removed, d.modified));
	}

	#[test]
	fn trailing_newline_counts() {
		let d = diff_lines(b"a\nb", b"a\nb\n");

		assert!(!d.is_empty());
		assert_eq!(1, d.added);
	}

	#[test]
	fn pure_addition() {
		let d = diff_lines(b"one\nthree", b"one\ntwo\nthree");

		assert_eq!(1, d.spans.len());
		let s = &d.spans[0];
		assert_eq!(SpanKind::Added, s.kind);
		assert_eq!(2, s.new_start);
		assert_eq!(2, s.old_start);
		assert_eq!(vec![b"two".to_vec()], s.new_lines);
		assert_eq!((1, 0, 0), (d.added, d.removed, d.modified));
	}

	#[test]
	fn pure_removal() {
		let d = diff_lines(b"one\ntwo\nthree", b"one\nthree");

		assert_eq!(SpanKind::Removed, d.spans[0].kind);
		assert_eq!(2, d.spans[0].old_start);
		assert_eq!((0, 1, 0), (d.added, d.removed, d.modified));
	}

	#[test]
	fn modification() {
		let d = diff_lines(b"title\nold body\nfooter", b"title\nnew body\nmore body\nfooter");

		assert_eq!(1, d.spans.len());
		let s = &d.spans[0];
		assert_eq!(SpanKind::Modified, s.kind);
		assert_eq!((2, 2), (s.old_start, s.new_start));
		assert_eq!((1, 0, 1), (d.added, d.removed, d.modified));
	}

	#[test]
	fn separate_spans() {
		let d = diff_lines(b"a\nb\nc\nd\ne", b"A\nb\nc\nd\ne\nf");

		assert_eq!(2, d.spans.len());
		assert_eq!(SpanKind::Modified, d.spans[0].kind);
		assert_eq!(1, d.spans[0].old_start);
		assert_eq!(SpanKind::Added, d.spans[1].kind);
		assert_eq!(6, d.spans[1].new_start);
	}

	#[test]
	fn binary_content() {
		let d = diff_lines(&[0xff, 0x00, b'\n', 0xfe], &[0xff, 0x00, b'\n', 0xfd]);

		assert_eq!(1, d.modified);
		assert_eq!(2, d.spans[0].new_start);
	}

	#[test]
	fn interleaved_edits() {
		let d = diff_lines(b"a\nb\nc\nd\ne\nf\ng", b"a\nX\nc\nY\ne\nZ\ng");

		assert_eq!(3, d.spans.len());
		assert!(d.spans.iter().all(|s| s.kind == SpanKind::Modified));
		assert_eq!(
			vec![2, 4, 6],
			d.spans.iter().map(|s| s.new_start).collect::<Vec<_>>()
		);
		assert_eq!((0, 0, 3), (d.added, d.removed, d.modified));
	}

	#[test]
	fn common_lines_are_found_in_a_rewrite() {
		let old: Vec<String> = (0..200).map(|i| format!("old {i}")).collect();
		let mut new: Vec<String> = (0..200).map(|i| format!("new {i}")).collect();
		new[120] = "old 37".to_string();

		let d = diff_lines(old.join("\n").as_bytes(), new.join("\n").as_bytes());

		// Everything but the one shared line changed
		assert_eq!(2, d.spans.len());
		assert_eq!(199 + 199, d.added + d.removed + 2 * d.modified);
	}

	#[test]
	fn large_total_rewrite() {
		let old: Vec<String> = (0..3_000).map(|i| format!("before line {i}")).collect();
		let new: Vec<String> = (0..3_000).map(|i| format!("after line {i}")).collect();

		let d = diff_lines(old.join("\n").as_bytes(), new.join("\n").as_bytes());

		assert_eq!(1, d.spans.len());
		assert_eq!(SpanKind::Modified, d.spans[0].kind);
		assert_eq!((0, 0, 3_000), (d.added, d.removed, d.modified));
	}

	#[test]
	fn empty_inputs() {
		assert!(diff_lines(b"", b"").is_empty());
		let d = diff_lines(b"", b"x");
		assert_eq!(1, d.modified);
	}
}
