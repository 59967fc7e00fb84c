//! Cached path objects.
//!
//! An [`FsPath`] is a cheap handle on a path string plus lazily computed
//! derived forms: the tilde-expanded text, the normalized path, the owning
//! backend and that backend's native representation. The derived forms are
//! tagged with the epochs they were computed under; the dispatcher in
//! [`super::Vfs`] checks the tags and recomputes from the string form when
//! they are stale.

use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::filesystem::NativeRep;
use super::registry::FsRecord;

/// How a path was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Starts at a root (`/`, `//vol:/`, or `~`).
    Absolute,
    /// Resolved against the current directory.
    Relative,
    /// A plain leaf appended to a normalized absolute base.
    Joined,
}

/// Cached normalized form.
#[derive(Debug, Clone)]
pub enum NormalizedForm {
    /// The path is its own normalized form.
    SelfAliased,
    /// A distinct normalized path.
    Owned(FsPath),
}

/// What a normalized form was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NormKey {
    pub vfs_id: u64,
    pub fs_epoch: u64,
    /// Only relative paths depend on the cwd.
    pub cwd_epoch: Option<u64>,
}

struct Binding {
    vfs_id: u64,
    epoch: u64,
    record: Arc<FsRecord>,
}

struct NativeSlot {
    vfs_id: u64,
    epoch: u64,
    record: Arc<FsRecord>,
    rep: NativeRep,
}

#[derive(Default)]
struct PathCache {
    translated: Option<String>,
    normalized: Option<(NormKey, NormalizedForm)>,
    binding: Option<Binding>,
    native: Option<NativeSlot>,
}

struct PathInner {
    text: String,
    kind: PathKind,
    base: Option<FsPath>,
    cache: Mutex<PathCache>,
}

/// A path with cached derived forms. Cloning shares the cache.
#[derive(Clone)]
pub struct FsPath(Arc<PathInner>);

impl FsPath {
    /// Path from its string form.
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if is_absolute_text(&text) {
            PathKind::Absolute
        } else {
            PathKind::Relative
        };
        Self::build(text, kind, None)
    }

    fn build(text: String, kind: PathKind, base: Option<FsPath>) -> Self {
        Self(Arc::new(PathInner {
            text,
            kind,
            base,
            cache: Mutex::new(PathCache::default()),
        }))
    }

    /// Append `leaf` to `base`.
    ///
    /// A plain leaf (no separator, not starting with `.`) on an absolute,
    /// already-normalized base makes a joined path that only has to
    /// normalize its suffix later. Anything else is joined segment by
    /// segment; an absolute leaf replaces the base.
    pub fn join(base: &FsPath, leaf: &str) -> FsPath {
        if is_absolute_text(leaf) {
            return FsPath::from_text(leaf);
        }
        if leaf.is_empty() {
            return base.clone();
        }
        let plain = !leaf.starts_with('.') && !leaf.contains('/');
        if plain && base.kind() != PathKind::Relative && base.is_known_normalized() {
            let text = append_segment(base.as_str(), leaf);
            return Self::build(text, PathKind::Joined, Some(base.clone()));
        }
        let mut text = base.as_str().to_string();
        for segment in leaf.split('/').filter(|s| !s.is_empty()) {
            text = append_segment(&text, segment);
        }
        FsPath::from_text(text)
    }

    /// The string form.
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// How the path was built.
    pub fn kind(&self) -> PathKind {
        self.0.kind
    }

    /// Base of a joined path.
    pub fn base(&self) -> Option<&FsPath> {
        self.0.base.as_ref()
    }

    /// Whether the path starts at a root once tildes are expanded.
    pub fn is_absolute(&self) -> bool {
        self.0.kind != PathKind::Relative
    }

    /// Whether both handles share one cache.
    pub fn ptr_eq(a: &FsPath, b: &FsPath) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Tilde-expanded text, computed once.
    pub fn translated(&self) -> String {
        let mut cache = self.0.cache.lock();
        if let Some(t) = &cache.translated {
            return t.clone();
        }
        let t = expand_tilde(&self.0.text).into_owned();
        cache.translated = Some(t.clone());
        t
    }

    /// Whether some earlier normalization found this path already normal.
    pub fn is_known_normalized(&self) -> bool {
        matches!(
            self.0.cache.lock().normalized,
            Some((_, NormalizedForm::SelfAliased))
        )
    }

    pub(crate) fn cached_normalized(&self, key: NormKey) -> Option<FsPath> {
        let cache = self.0.cache.lock();
        match &cache.normalized {
            Some((k, form)) if *k == key => Some(match form {
                NormalizedForm::SelfAliased => self.clone(),
                NormalizedForm::Owned(p) => p.clone(),
            }),
            _ => None,
        }
    }

    /// Record `text` as the normalized form and return the normalized path.
    pub(crate) fn store_normalized(&self, key: NormKey, text: String) -> FsPath {
        if text == self.0.text {
            self.0.cache.lock().normalized = Some((key, NormalizedForm::SelfAliased));
            return self.clone();
        }
        let owned = FsPath::from_text(text);
        owned.0.cache.lock().normalized = Some((key, NormalizedForm::SelfAliased));
        self.0.cache.lock().normalized = Some((key, NormalizedForm::Owned(owned.clone())));
        owned
    }

    pub(crate) fn cached_binding(&self, vfs_id: u64, epoch: u64) -> Option<Arc<FsRecord>> {
        let cache = self.0.cache.lock();
        match &cache.binding {
            Some(b) if b.vfs_id == vfs_id && b.epoch == epoch => Some(Arc::clone(&b.record)),
            _ => None,
        }
    }

    pub(crate) fn store_binding(&self, vfs_id: u64, epoch: u64, record: Arc<FsRecord>) {
        let mut cache = self.0.cache.lock();
        let stale_native = cache
            .native
            .as_ref()
            .is_some_and(|n| n.vfs_id != vfs_id || n.epoch != epoch || !Arc::ptr_eq(&n.record, &record));
        if stale_native {
            cache.native = None;
        }
        cache.binding = Some(Binding {
            vfs_id,
            epoch,
            record,
        });
    }

    pub(crate) fn clear_binding(&self) {
        let mut cache = self.0.cache.lock();
        cache.binding = None;
        cache.native = None;
    }

    pub(crate) fn cached_native(
        &self,
        vfs_id: u64,
        epoch: u64,
        record: &Arc<FsRecord>,
    ) -> Option<NativeRep> {
        let cache = self.0.cache.lock();
        match &cache.native {
            Some(n) if n.vfs_id == vfs_id && n.epoch == epoch && Arc::ptr_eq(&n.record, record) => {
                Some(Arc::clone(&n.rep))
            }
            _ => None,
        }
    }

    pub(crate) fn store_native(
        &self,
        vfs_id: u64,
        epoch: u64,
        record: Arc<FsRecord>,
        rep: NativeRep,
    ) {
        self.0.cache.lock().native = Some(NativeSlot {
            vfs_id,
            epoch,
            record,
            rep,
        });
    }
}

impl fmt::Debug for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsPath")
            .field("text", &self.0.text)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.text)
    }
}

/// Equality is on the string form; use `Vfs::paths_equal` to compare
/// normalized forms.
impl PartialEq for FsPath {
    fn eq(&self, other: &Self) -> bool {
        self.0.text == other.0.text
    }
}

impl Eq for FsPath {}

impl Hash for FsPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.text.hash(state);
    }
}

impl From<&str> for FsPath {
    fn from(s: &str) -> Self {
        FsPath::from_text(s)
    }
}

impl From<String> for FsPath {
    fn from(s: String) -> Self {
        FsPath::from_text(s)
    }
}

// ============================================================================
// String helpers
// ============================================================================

fn is_absolute_text(text: &str) -> bool {
    text.starts_with('/') || text.starts_with('~')
}

fn append_segment(base: &str, leaf: &str) -> String {
    if base.is_empty() {
        leaf.to_string()
    } else if base.ends_with('/') {
        format!("{base}{leaf}")
    } else {
        format!("{base}/{leaf}")
    }
}

fn home_dir() -> Option<String> {
    std::env::var("HOME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| dirs::home_dir().map(|p| p.to_string_lossy().into_owned()))
}

/// Expand a leading `~` or `~user`.
///
/// Only the current user's name is resolved; `~other` stays literal.
pub fn expand_tilde(text: &str) -> Cow<'_, str> {
    if !text.starts_with('~') {
        return Cow::Borrowed(text);
    }
    let (user, rest) = match text[1..].find('/') {
        Some(i) => (&text[1..i + 1], &text[i + 1..]),
        None => (&text[1..], ""),
    };
    if user.is_empty() {
        return shellexpand::tilde_with_context(text, home_dir);
    }
    if user == whoami::username() {
        if let Some(home) = home_dir() {
            return Cow::Owned(format!("{home}{rest}"));
        }
    }
    Cow::Borrowed(text)
}

/// Length of the volume root at the start of an absolute path: 1 for `/`,
/// the full `//name:/` prefix for a named volume, 0 for relative text.
pub fn volume_root_len(path: &str) -> usize {
    if let Some(rest) = path.strip_prefix("//") {
        match rest.find('/') {
            Some(i) => i + 3,
            None => path.len(),
        }
    } else if path.starts_with('/') {
        1
    } else {
        0
    }
}

/// Whether `path[checkpoint..]` has anything lexical normalization would
/// change.
pub fn needs_lexical(path: &str, checkpoint: usize) -> bool {
    let root = volume_root_len(path);
    if root > 0 && root == path.len() && path.starts_with("//") && !path.ends_with('/') {
        return true;
    }
    let start = checkpoint.max(root).min(path.len());
    let suffix = &path[start..];
    if suffix.contains("//") || (path.len() > root && path.ends_with('/')) {
        return true;
    }
    suffix
        .split('/')
        .any(|seg| seg == "." || seg == "..")
}

/// Remove `.` and `..` segments and repeated separators. `..` never climbs
/// above the volume root. Input must be absolute.
pub fn normalize_lexical(path: &str) -> String {
    let root_len = volume_root_len(path);
    let mut root = path[..root_len].to_string();
    if root.starts_with("//") && !root.ends_with('/') {
        root.push('/');
    }
    let mut stack: Vec<&str> = Vec::new();
    for seg in path[root_len..].split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
    root + &stack.join("/")
}

/// Normalize from `checkpoint`, returning the input untouched when the
/// suffix has nothing to fix.
pub fn normalize_lexical_from(path: &str, checkpoint: usize) -> Cow<'_, str> {
    if needs_lexical(path, checkpoint) {
        Cow::Owned(normalize_lexical(path))
    } else {
        Cow::Borrowed(path)
    }
}
