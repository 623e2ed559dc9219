//! Path Scheme
//!
//! Maps entity identities to their location in the coordination tree.
//! Everything in here is pure string manipulation.

pub const IMAGE_ROOT: &str = "/nodepool/images";
pub const LAUNCHER_ROOT: &str = "/nodepool/launchers";
pub const NODE_ROOT: &str = "/nodepool/nodes";
pub const REQUEST_ROOT: &str = "/nodepool/requests";
pub const REQUEST_LOCK_ROOT: &str = "/nodepool/requests-lock";
pub const ELECTION_ROOT: &str = "/nodepool/elections";

/// Name of the lock child under lockable entities
pub const LOCK_NAME: &str = "lock";

pub fn election(election: &str) -> String {
    format!("{}/{}", ELECTION_ROOT, election)
}

pub fn image(image: &str) -> String {
    format!("{}/{}", IMAGE_ROOT, image)
}

pub fn image_build_request(image_name: &str) -> String {
    format!("{}/request-build", image(image_name))
}

pub fn image_builds(image_name: &str) -> String {
    format!("{}/builds", image(image_name))
}

pub fn image_build(image_name: &str, build_number: &str) -> String {
    format!("{}/{}", image_builds(image_name), build_number)
}

pub fn image_pause(image_name: &str) -> String {
    format!("{}/pause", image(image_name))
}

pub fn image_build_lock(image_name: &str) -> String {
    format!("{}/{}", image_builds(image_name), LOCK_NAME)
}

pub fn image_build_number_lock(image_name: &str, build_number: &str) -> String {
    format!("{}/{}", image_build(image_name, build_number), LOCK_NAME)
}

pub fn image_providers(image_name: &str, build_number: &str) -> String {
    format!("{}/providers", image_build(image_name, build_number))
}

pub fn image_provider(image_name: &str, build_number: &str, provider: &str) -> String {
    format!("{}/{}", image_providers(image_name, build_number), provider)
}

pub fn image_uploads(image_name: &str, build_number: &str, provider: &str) -> String {
    format!("{}/images", image_provider(image_name, build_number, provider))
}

pub fn image_upload(
    image_name: &str,
    build_number: &str,
    provider: &str,
    upload_number: &str,
) -> String {
    format!(
        "{}/{}",
        image_uploads(image_name, build_number, provider),
        upload_number
    )
}

pub fn image_upload_lock(image_name: &str, build_number: &str, provider: &str) -> String {
    format!(
        "{}/{}",
        image_uploads(image_name, build_number, provider),
        LOCK_NAME
    )
}

pub fn image_upload_number_lock(
    image_name: &str,
    build_number: &str,
    provider: &str,
    upload_number: &str,
) -> String {
    format!(
        "{}/{}",
        image_upload(image_name, build_number, provider, upload_number),
        LOCK_NAME
    )
}

pub fn launcher(launcher_id: &str) -> String {
    format!("{}/{}", LAUNCHER_ROOT, launcher_id)
}

pub fn node(node_id: &str) -> String {
    format!("{}/{}", NODE_ROOT, node_id)
}

pub fn node_lock(node_id: &str) -> String {
    format!("{}/{}", node(node_id), LOCK_NAME)
}

pub fn request(request_id: &str) -> String {
    format!("{}/{}", REQUEST_ROOT, request_id)
}

pub fn request_lock(request_id: &str) -> String {
    format!("{}/{}", REQUEST_LOCK_ROOT, request_id)
}

/// Parent of an absolute path (`/` for top-level entries)
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

/// Last segment of a path
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Join a child name onto a parent path
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Whether `path` is `prefix` itself or lies underneath it
pub fn is_under(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return path.starts_with('/');
    }
    path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

/// Id of a direct child of `root`, or `None` for the root itself and
/// anything nested deeper (lock entries and their contenders)
pub fn direct_child<'a>(root: &str, path: &'a str) -> Option<&'a str> {
    if !is_under(path, root) || path == root {
        return None;
    }
    let rest = &path[root.len() + 1..];
    if rest.is_empty() || rest.contains('/') || rest == LOCK_NAME {
        return None;
    }
    Some(rest)
}
