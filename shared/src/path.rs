use std::borrow::Cow;

use crate::{directory::Directory, registry::ResourceKey};

/// Maximum number of substitutions while resolving a path
pub const MAX_ALIAS_DEPTH: usize = 8;

const WILDCARDS: [char; 4] = ['?', '*', '+', '#'];

/// True for strings usable as a single path segment or wire field: host
/// ids, driver ids, resource and subscriber names.
pub fn is_plain_segment(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| c == '/' || c == ',' || c.is_whitespace() || WILDCARDS.contains(&c))
}

pub fn has_wildcards(expr: &str) -> bool {
    expr.contains(WILDCARDS)
}

/// Absolute, without empty, `.` or `..` segments. A single trailing `/` is
/// allowed, it addresses a directory.
pub fn is_normalized(uri: &str) -> bool {
    let Some(body) = uri.strip_prefix('/') else {
        return false;
    };
    if body.is_empty() {
        return true;
    }
    let body = body.strip_suffix('/').unwrap_or(body);
    !body.is_empty()
        && body
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Makes `uri` absolute and removes `.`, `..` and repeated separators.
///
/// Relative paths are taken relative to `work_dir`. Inputs that are
/// already normalized are returned as they are, without allocating.
pub fn normalize<'a>(uri: &'a str, work_dir: &str) -> Cow<'a, str> {
    if is_normalized(uri) {
        return Cow::Borrowed(uri);
    }

    let base = if uri.starts_with('/') { None } else { Some(work_dir) };
    let mut segments: Vec<&str> = Vec::new();
    for segment in base
        .into_iter()
        .flat_map(|dir| dir.split('/'))
        .chain(uri.split('/'))
    {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            segment => segments.push(segment),
        }
    }

    let mut path = String::with_capacity(uri.len() + work_dir.len() + 1);
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() || (uri.ends_with('/') && !segments.is_empty()) {
        path.push('/');
    }
    Cow::Owned(path)
}

/// Outcome of `Directory::resolve`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution<'a> {
    /// Canonical path, or the normalized input if resolution failed
    pub path: Cow<'a, str>,
    /// False if an alias was unknown or the substitution limit was hit
    pub resolved: bool,
}

impl<'a> Resolution<'a> {
    /// Host id of a resolved `/host/<id>...` path
    pub fn host(&self) -> Option<&str> {
        if !self.resolved {
            return None;
        }
        let rest = self.path.strip_prefix("/host/")?;
        let host = rest.split('/').next()?;
        (!host.is_empty()).then_some(host)
    }

    /// LID of a resolved path: the part below `/host/<id>/`, whichever host
    /// that is
    pub fn lid(&self) -> Option<&str> {
        let host = self.host()?;
        let rest = &self.path["/host/".len() + host.len()..];
        rest.strip_prefix('/')
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathDomain {
    /// Unknown, incomplete or invalid
    None,
    Root,
    Host,
    Driver,
    Resource,
    Env,
    Alias,
}

impl PathDomain {
    pub fn is_dir(&self) -> bool {
        matches!(self, PathDomain::Root | PathDomain::Host | PathDomain::Driver)
    }
}

/// Classification of a normalized absolute path.
///
/// `local_path` always points into the analysed string:
///
/// | path | domain | local_path |
/// |---|---|---|
/// | `/host` | Root | `host` |
/// | `/host/beta` | Host | `beta` |
/// | `/host/<local>/` | Driver | `` |
/// | `/local/gpio/relay/1` | Resource | `relay/1` (driver `gpio`) |
/// | `/host/beta/knx/door` | Resource | `knx/door` (host `beta`) |
/// | `/alias/lights` | Alias | `lights` |
/// | `/env/LANG` | Env | `LANG` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo<'a> {
    pub domain: PathDomain,
    pub local_path: &'a str,
    /// Set for `Host` paths naming a known host, and for resources of a
    /// known remote host
    pub host: Option<&'a str>,
    /// Set for driver paths and local resources if the driver is known
    pub driver: Option<&'a str>,
    /// Set if the resource is registered
    pub resource: Option<ResourceKey>,
}

impl<'a> PathInfo<'a> {
    pub fn none() -> Self {
        Self::new(PathDomain::None, "")
    }

    fn new(domain: PathDomain, local_path: &'a str) -> Self {
        Self {
            domain,
            local_path,
            host: None,
            driver: None,
            resource: None,
        }
    }

    /// LID of the addressed resource, if the owner is known
    pub fn lid(&self) -> Option<Cow<'a, str>> {
        if self.domain != PathDomain::Resource {
            return None;
        }
        match (self.host, self.driver) {
            (Some(_), _) => Some(Cow::Borrowed(self.local_path)),
            (None, Some(driver)) => Some(Cow::Owned(format!("{}/{}", driver, self.local_path))),
            (None, None) => None,
        }
    }
}

enum Step {
    Done,
    Rewrite(String),
    Fail,
}

// Path operations on the directory
impl Directory {
    /// `normalize` relative to the directory's working directory
    pub fn normalize<'a>(&self, uri: &'a str) -> Cow<'a, str> {
        normalize(uri, self.work_dir())
    }

    /// Resolves aliases and the `/local` shorthand into `/host/<id>/...`.
    ///
    /// Never warns; on an unknown alias or after `MAX_ALIAS_DEPTH`
    /// substitutions the normalized input is returned with `resolved`
    /// cleared.
    pub fn resolve<'a>(&self, uri: &'a str, work_dir: Option<&str>) -> Resolution<'a> {
        let normalized = normalize(uri, work_dir.unwrap_or(self.work_dir()));
        let mut current = normalized.clone();
        let mut depth = 0;
        loop {
            match self.resolve_step(&current) {
                Step::Done => {
                    return Resolution {
                        path: current,
                        resolved: true,
                    }
                }
                Step::Rewrite(next) => {
                    if depth == MAX_ALIAS_DEPTH {
                        break;
                    }
                    depth += 1;
                    current = Cow::Owned(next);
                }
                Step::Fail => break,
            }
        }
        Resolution {
            path: normalized,
            resolved: false,
        }
    }

    fn resolve_step(&self, path: &str) -> Step {
        if let Some(rest) = strip_root(path, "local") {
            return Step::Rewrite(format!("/host/{}{}", self.local_host(), rest));
        }
        if strip_root(path, "alias").is_some() {
            return match self.longest_alias(path) {
                Some((key, target)) => {
                    let joined = format!("{}{}", target, &path[key.len()..]);
                    Step::Rewrite(normalize(&joined, "/alias").into_owned())
                }
                None => Step::Fail,
            };
        }
        Step::Done
    }

    /// Classifies `path` without resolving aliases and without looking up
    /// resources. Non-normalized input yields `PathDomain::None`.
    pub fn classify<'a>(&self, path: &'a str) -> PathInfo<'a> {
        if !is_normalized(path) {
            return PathInfo::none();
        }
        let (root, rest) = split_segment(&path[1..]);
        let Some(rest) = rest else {
            return PathInfo::new(PathDomain::Root, root);
        };
        match root {
            "host" => {
                let (host, tail) = split_segment(rest);
                let known = self.is_local_host(host) || self.host(host).is_some();
                match tail {
                    None => PathInfo {
                        host: known.then_some(host),
                        ..PathInfo::new(PathDomain::Host, host)
                    },
                    Some(tail) if self.is_local_host(host) => self.classify_local(tail),
                    Some(tail) => PathInfo {
                        host: known.then_some(host),
                        ..PathInfo::new(PathDomain::Resource, tail)
                    },
                }
            }
            "local" => self.classify_local(rest),
            "alias" => PathInfo::new(PathDomain::Alias, rest),
            "env" => PathInfo::new(PathDomain::Env, rest),
            _ => PathInfo::none(),
        }
    }

    fn classify_local<'a>(&self, tail: &'a str) -> PathInfo<'a> {
        let (driver, name) = split_segment(tail);
        let known = self.has_driver(driver).then_some(driver);
        match name {
            None => PathInfo {
                driver: known,
                ..PathInfo::new(PathDomain::Driver, driver)
            },
            Some(name) => PathInfo {
                driver: known,
                ..PathInfo::new(PathDomain::Resource, name)
            },
        }
    }
}

/// `Some("")` for `/<root>`, `Some("/...")` below it
fn strip_root<'p>(path: &'p str, root: &str) -> Option<&'p str> {
    let rest = path.strip_prefix('/')?.strip_prefix(root)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn split_segment(s: &str) -> (&str, Option<&str>) {
    match s.find('/') {
        Some(i) => (&s[..i], Some(&s[i + 1..])),
        None => (s, None),
    }
}

// Wildcards

/// Matches `uri` against a single expression.
///
/// `?` matches one character, `*` any run, `+` a non-empty run; none of them
/// crosses a `/`. `#` matches the rest including `/` and must come last.
/// Malformed expressions match nothing.
pub fn match_single(uri: &str, expr: &str) -> bool {
    if expr.is_empty() {
        return false;
    }
    if let Some(pos) = expr.find('#') {
        if pos + 1 != expr.len() {
            return false;
        }
    }
    let uri: Vec<char> = uri.chars().collect();
    let expr: Vec<char> = expr.chars().collect();
    glob(&uri, &expr)
}

/// Matches `uri` against a comma or whitespace separated list of
/// expressions.
pub fn matches(uri: &str, pattern: &str) -> bool {
    split_pattern(pattern).any(|expr| match_single(uri, expr))
}

pub fn split_pattern(pattern: &str) -> impl Iterator<Item = &str> {
    pattern
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|expr| !expr.is_empty())
}

fn glob(uri: &[char], expr: &[char]) -> bool {
    let (mut u, mut p) = (0, 0);
    // Expression position after the last `*`/`+` and where its run ends
    let mut star: Option<(usize, usize)> = None;
    let in_segment = |u: usize| u < uri.len() && uri[u] != '/';

    loop {
        if let Some(&c) = expr.get(p) {
            match c {
                '#' => return true,
                '*' => {
                    star = Some((p + 1, u));
                    p += 1;
                    continue;
                }
                '+' if in_segment(u) => {
                    star = Some((p + 1, u + 1));
                    p += 1;
                    u += 1;
                    continue;
                }
                '?' if in_segment(u) => {
                    p += 1;
                    u += 1;
                    continue;
                }
                '+' | '?' => {}
                c if uri.get(u) == Some(&c) => {
                    p += 1;
                    u += 1;
                    continue;
                }
                _ => {}
            }
        } else if u == uri.len() {
            return true;
        }

        // Mismatch: the last run takes one more character, if it can.
        // Earlier runs are pinned by the `/` that follows them.
        match star {
            Some((after, end)) if in_segment(end) => {
                star = Some((after, end + 1));
                p = after;
                u = end + 1;
            }
            _ => return false,
        }
    }
}

/// Wildcards may only appear below `/host/<host>/<driver>/`.
pub(crate) fn wildcards_placed_well(path: &str) -> bool {
    if !has_wildcards(path) {
        return true;
    }
    let Some(rest) = path.strip_prefix("/host/") else {
        return false;
    };
    let Some(host_end) = rest.find('/') else {
        return false;
    };
    let Some(driver_end) = rest[host_end + 1..].find('/') else {
        return false;
    };
    let prefix_len = "/host/".len() + host_end + 1 + driver_end + 1;
    !has_wildcards(&path[..prefix_len])
}
