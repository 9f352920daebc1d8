//! The Route Matcher: given a Route's filter predicates and a
//! candidate container or message, decides membership.

use glob::Pattern;

use crate::container::ContainerInfo;
use crate::message::Message;
use crate::route::RouteFilter;

/// Does `filter` match this container identity? Message-specific
/// predicates (source tag) are not evaluated here; see
/// [`matches_message`].
pub fn matches_container(filter: &RouteFilter, container: &ContainerInfo) -> bool {
    if filter.is_empty() {
        return true;
    }

    if let Some(prefix) = &filter.filter_id {
        if !container.id.starts_with(prefix.as_str()) {
            return false;
        }
    }

    if let Some(pattern) = &filter.filter_name {
        match Pattern::new(pattern) {
            Ok(glob) => {
                if !glob.matches(container.normal_name()) {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }

    for (key, pattern) in &filter.filter_labels {
        match container.labels.get(key) {
            Some(value) => {
                if pattern.is_empty() {
                    continue;
                }
                match Pattern::new(pattern) {
                    Ok(glob) if glob.matches(value) => {}
                    _ => return false,
                }
            }
            None => return false,
        }
    }

    true
}

/// Does `filter` match this message, including the container
/// identity it carries and its source tag?
pub fn matches_message(filter: &RouteFilter, message: &Message) -> bool {
    if !matches_container(filter, &message.container) {
        return false;
    }
    if !filter.filter_sources.is_empty() && !filter.filter_sources.contains(&message.source) {
        return false;
    }
    true
}

/// `true` iff no filters are set, or the name filter contains a glob
/// wildcard — i.e. the Route is capable of matching more than one
/// container at a time.
pub fn is_multi_container(filter: &RouteFilter) -> bool {
    if filter.is_empty() {
        return true;
    }
    match &filter.filter_name {
        Some(pattern) => pattern.contains(['*', '?', '[']),
        None => false,
    }
}
