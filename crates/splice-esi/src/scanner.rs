use std::sync::LazyLock;

use regex::bytes::Regex;

/// Matches the opening of a regular ESI tag and captures its name.
static ESI_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<esi:([a-z]+)").unwrap());

/// Matches the opening of the inline escape construct `<!--esi ... -->`.
static ESCAPE_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<!--esi").unwrap());

/// Byte length of the `<!--esi` opening marker.
pub(crate) const ESCAPE_OPEN_LEN: usize = 7;

/// The tag dialect dispatched by the scanner.
///
/// `Try` is recognized so the scanner can skip past it, but it has no
/// evaluator yet: its span is always left intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Comment,
    Choose,
    Escape,
    Include,
    Remove,
    Try,
    Vars,
}

impl TagKind {
    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"comment" => Some(Self::Comment),
            b"choose" => Some(Self::Choose),
            b"include" => Some(Self::Include),
            b"remove" => Some(Self::Remove),
            b"try" => Some(Self::Try),
            b"vars" => Some(Self::Vars),
            _ => None,
        }
    }
}

/// One ESI construct located by the scanner. Offsets are relative to the
/// slice handed to [`next_construct`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Construct {
    /// A `<esi:NAME` opening. `name_end` points just past the tag name;
    /// `kind` is `None` for tag-like openings with no recognized name.
    Tag {
        start: usize,
        name_end: usize,
        kind: Option<TagKind>,
    },
    /// A `<!--esi` opening. The escaped content starts at `inner_start`.
    Escape { start: usize, inner_start: usize },
}

impl Construct {
    /// Where this construct begins in the scanned slice.
    pub(crate) fn start(&self) -> usize {
        match self {
            Self::Tag { start, .. } | Self::Escape { start, .. } => *start,
        }
    }
}

/// Locate the next ESI construct in `buf`, whichever of the two opening
/// forms comes first. Returns `None` when no more constructs exist.
pub(crate) fn next_construct(buf: &[u8]) -> Option<Construct> {
    let tag = ESI_OPEN.captures(buf);
    let escape = ESCAPE_OPEN.find(buf);

    if let Some(esc) = &escape {
        let before_tag = tag
            .as_ref()
            .and_then(|c| c.get(0))
            .is_none_or(|m| esc.start() < m.start());
        if before_tag {
            return Some(Construct::Escape {
                start: esc.start(),
                inner_start: esc.start() + ESCAPE_OPEN_LEN,
            });
        }
    }

    tag.map(|caps| {
        let name = caps.get(1).unwrap();
        Construct::Tag {
            start: caps.get(0).unwrap().start(),
            name_end: name.end(),
            kind: TagKind::from_name(name.as_bytes()),
        }
    })
}

/// Cheap pre-filter: does `buf` contain anything that looks like an ESI
/// construct? Hosts use this to skip the full processing pass.
pub fn has_opened_tags(buf: &[u8]) -> bool {
    ESI_OPEN.is_match(buf) || ESCAPE_OPEN.is_match(buf)
}

/// Find `needle` in `haystack` starting at `from`, returning the absolute
/// range of the match. Close markers are fixed literals, so no regex.
pub(crate) fn find_literal(haystack: &[u8], needle: &[u8], from: usize) -> Option<(usize, usize)> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| (from + pos, from + pos + needle.len()))
}
