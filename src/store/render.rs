//! Text production for saves: in-place patching of the original document,
//! and the canonical block layout used when patching is not possible.

use super::layout::{EntrySpan, FieldSpan, Layout, MappingSpan, SeqSpan, Splice, Unsupported};
use crate::menu::{Config, Group, Item, MenuNode};
use std::collections::BTreeMap;

type Patch<T = ()> = Result<T, Unsupported>;

/// Rewrite `text` (which parses to `baseline`) so that it parses to
/// `config`, touching only the lines that differ.
///
/// `None` means the layout is outside what the indexer understands. The
/// caller still has to verify the result.
pub(crate) fn patch(text: &str, baseline: &Config, config: &Config) -> Option<String> {
    let layout = Layout::parse(text)?;
    let mut splices = Vec::new();
    patch_root(&layout, baseline, config, &mut splices).ok()?;
    layout.assemble(splices).ok()
}

/// Block-style rendering with two-space indentation and default fields
/// omitted.
pub(crate) fn canonical(config: &Config) -> String {
    let mut out = items_field("", 0, &config.items, "").join("\n");
    out.push('\n');
    out
}

fn patch_root(
    layout: &Layout<'_>,
    baseline: &Config,
    config: &Config,
    out: &mut Vec<Splice>,
) -> Patch {
    if baseline.items == config.items {
        return Ok(());
    }
    let root = &layout.root;
    match root.field("items") {
        Some(field) => patch_items_field(
            layout,
            field,
            root.key_col,
            &baseline.items,
            &config.items,
            out,
        ),
        None => {
            let at = root.end().unwrap_or(layout.lines.len());
            let pad = " ".repeat(root.key_col);
            out.push(Splice::insert(at, items_field(&pad, root.key_col, &config.items, "")));
            Ok(())
        }
    }
}

fn patch_items_field(
    layout: &Layout<'_>,
    field: &FieldSpan,
    key_col: usize,
    old: &[MenuNode],
    new: &[MenuNode],
    out: &mut Vec<Splice>,
) -> Patch {
    match &field.seq {
        Some(seq) if !new.is_empty() => patch_sequence(layout, seq, old, new, out),
        _ => {
            let lines = items_field(
                field.prefix(layout),
                key_col,
                new,
                &field.comment_suffix(layout),
            );
            out.push(Splice::replace(field.line..field.end, lines));
            Ok(())
        }
    }
}

fn patch_sequence(
    layout: &Layout<'_>,
    seq: &SeqSpan,
    old: &[MenuNode],
    new: &[MenuNode],
    out: &mut Vec<Splice>,
) -> Patch {
    if seq.entries.len() != old.len() || old.is_empty() {
        return Err(Unsupported);
    }

    let same_shape =
        old.len() == new.len() && old.iter().zip(new).all(|(a, b)| a.kind() == b.kind());
    if same_shape {
        for ((entry, a), b) in seq.entries.iter().zip(old).zip(new) {
            if a != b {
                patch_entry(layout, entry, seq.indent, a, b, out)?;
            }
        }
        return Ok(());
    }

    // Structural change: rebuild the entry region, reusing original text.
    let plan = align(old, new);
    let region = seq.entries[0].lead..seq.entries[old.len() - 1].end;
    let mut lines = Vec::new();
    for (node, reuse) in new.iter().zip(plan) {
        match reuse {
            Some(idx) => {
                let entry = &seq.entries[idx];
                let mut local = Vec::new();
                if old[idx] != *node {
                    patch_entry(layout, entry, seq.indent, &old[idx], node, &mut local)?;
                }
                lines.extend(layout.apply(entry.lead..entry.end, local)?);
            }
            None => lines.extend(render_node(node, seq.indent)),
        }
    }
    out.push(Splice::replace(region, lines));
    Ok(())
}

/// Decide which original entry (if any) each new node reuses.
///
/// Unchanged nodes are anchored by a longest common subsequence. Between two
/// anchors, unclaimed nodes of the same kind pair up in order and are
/// patched in place. Remaining nodes reuse any equal, still unclaimed
/// entry (a move) or are rendered fresh.
fn align(old: &[MenuNode], new: &[MenuNode]) -> Vec<Option<usize>> {
    let (n, m) = (old.len(), new.len());
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut plan = vec![None; m];
    let mut used = vec![false; n];
    let mut anchors = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            anchors.push((i, j));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    for &(i, j) in &anchors {
        plan[j] = Some(i);
        used[i] = true;
    }

    let mut prev = (0, 0);
    for &(ai, aj) in anchors.iter().chain(std::iter::once(&(n, m))) {
        let olds: Vec<usize> = (prev.0..ai).filter(|&i| !used[i]).collect();
        let news: Vec<usize> = (prev.1..aj).filter(|&j| plan[j].is_none()).collect();
        let mut cursor = 0;
        for j in news {
            let found = olds[cursor..]
                .iter()
                .position(|&i| old[i].kind() == new[j].kind());
            if let Some(offset) = found {
                let i = olds[cursor + offset];
                plan[j] = Some(i);
                used[i] = true;
                cursor += offset + 1;
            }
        }
        prev = (ai + 1, aj + 1);
    }

    for j in 0..m {
        if plan[j].is_some() {
            continue;
        }
        if let Some(i) = (0..n).find(|&i| !used[i] && old[i] == new[j]) {
            plan[j] = Some(i);
            used[i] = true;
        }
    }
    plan
}

fn patch_entry(
    layout: &Layout<'_>,
    entry: &EntrySpan,
    dash_col: usize,
    old: &MenuNode,
    new: &MenuNode,
    out: &mut Vec<Splice>,
) -> Patch {
    let map = match (&entry.map, old, new) {
        (Some(map), MenuNode::Item(_), MenuNode::Item(_)) => map,
        (Some(map), MenuNode::Group(_), MenuNode::Group(_)) => map,
        (_, MenuNode::Separator, MenuNode::Separator) => return Ok(()),
        _ => {
            out.push(Splice::replace(entry.start..entry.end, render_node(new, dash_col)));
            return Ok(());
        }
    };
    match (old, new) {
        (MenuNode::Item(a), MenuNode::Item(b)) => patch_item(layout, map, a, b, out),
        (MenuNode::Group(a), MenuNode::Group(b)) => patch_group(layout, map, a, b, out),
        _ => Err(Unsupported),
    }
}

fn patch_item(
    layout: &Layout<'_>,
    map: &MappingSpan,
    a: &Item,
    b: &Item,
    out: &mut Vec<Splice>,
) -> Patch {
    if a.label != b.label {
        set_scalar(layout, map, "label", &scalar(&b.label), out)?;
    }
    if a.cmd != b.cmd {
        set_scalar(layout, map, "cmd", &scalar(&b.cmd), out)?;
    }
    if a.terminal != b.terminal {
        set_scalar(layout, map, "terminal", bool_str(b.terminal), out)?;
    }
    if a.confirm != b.confirm {
        set_scalar(layout, map, "confirm", bool_str(b.confirm), out)?;
    }
    if a.env != b.env {
        set_env(layout, map, &b.env, out)?;
    }
    Ok(())
}

fn patch_group(
    layout: &Layout<'_>,
    map: &MappingSpan,
    a: &Group,
    b: &Group,
    out: &mut Vec<Splice>,
) -> Patch {
    if a.label != b.label {
        set_scalar(layout, map, "label", &scalar(&b.label), out)?;
    }
    if a.items != b.items {
        match map.field("items") {
            Some(field) => {
                patch_items_field(layout, field, map.key_col, &a.items, &b.items, out)?
            }
            None => {
                let at = map.end().ok_or(Unsupported)?;
                let pad = " ".repeat(map.key_col);
                out.push(Splice::insert(at, items_field(&pad, map.key_col, &b.items, "")));
            }
        }
    }
    Ok(())
}

fn set_scalar(
    layout: &Layout<'_>,
    map: &MappingSpan,
    key: &str,
    rendered: &str,
    out: &mut Vec<Splice>,
) -> Patch {
    match map.field(key) {
        Some(field) if field.inline => {
            let line = layout.lines[field.line];
            let sep = if field.value.is_empty() { " " } else { "" };
            let patched = format!(
                "{}{}{}{}",
                &line[..field.value.start],
                sep,
                rendered,
                &line[field.value.end..]
            );
            out.push(Splice::replace(field.line..field.line + 1, vec![patched]));
        }
        Some(field) => {
            let patched = format!(
                "{}{}: {}{}",
                field.prefix(layout),
                key,
                rendered,
                field.comment_suffix(layout)
            );
            out.push(Splice::replace(field.line..field.end, vec![patched]));
        }
        None => {
            let at = map.end().ok_or(Unsupported)?;
            let line = format!("{}{}: {}", " ".repeat(map.key_col), key, rendered);
            out.push(Splice::insert(at, vec![line]));
        }
    }
    Ok(())
}

fn set_env(
    layout: &Layout<'_>,
    map: &MappingSpan,
    env: &BTreeMap<String, String>,
    out: &mut Vec<Splice>,
) -> Patch {
    let inner = " ".repeat(map.key_col + 2);
    match map.field("env") {
        Some(field) if env.is_empty() => {
            let lines = if field.on_dash_line(layout) {
                vec![format!("{}env: {{}}", field.prefix(layout))]
            } else {
                Vec::new()
            };
            out.push(Splice::replace(field.line..field.end, lines));
        }
        Some(field) => {
            let mut lines = vec![format!(
                "{}env:{}",
                field.prefix(layout),
                field.comment_suffix(layout)
            )];
            lines.extend(env_lines(&inner, env));
            out.push(Splice::replace(field.line..field.end, lines));
        }
        None if env.is_empty() => {}
        None => {
            let at = map.end().ok_or(Unsupported)?;
            let mut lines = vec![format!("{}env:", " ".repeat(map.key_col))];
            lines.extend(env_lines(&inner, env));
            out.push(Splice::insert(at, lines));
        }
    }
    Ok(())
}

/// `items:` followed by its entries, or `items: []`. `prefix` is whatever
/// precedes the key on its line; entries are indented from `key_col`.
fn items_field(prefix: &str, key_col: usize, nodes: &[MenuNode], comment: &str) -> Vec<String> {
    if nodes.is_empty() {
        return vec![format!("{}items: []{}", prefix, comment)];
    }
    let mut lines = vec![format!("{}items:{}", prefix, comment)];
    for node in nodes {
        lines.extend(render_node(node, key_col + 2));
    }
    lines
}

fn render_node(node: &MenuNode, dash_col: usize) -> Vec<String> {
    let pad = " ".repeat(dash_col);
    let inner = " ".repeat(dash_col + 2);
    match node {
        MenuNode::Separator => vec![format!("{}- type: separator", pad)],
        MenuNode::Item(item) => {
            let mut lines = vec![
                format!("{}- type: item", pad),
                format!("{}label: {}", inner, scalar(&item.label)),
                format!("{}cmd: {}", inner, scalar(&item.cmd)),
            ];
            if item.terminal {
                lines.push(format!("{}terminal: true", inner));
            }
            if item.confirm {
                lines.push(format!("{}confirm: true", inner));
            }
            if !item.env.is_empty() {
                lines.push(format!("{}env:", inner));
                lines.extend(env_lines(&format!("{}  ", inner), &item.env));
            }
            lines
        }
        MenuNode::Group(group) => {
            let mut lines = vec![
                format!("{}- type: group", pad),
                format!("{}label: {}", inner, scalar(&group.label)),
            ];
            lines.extend(items_field(&inner, dash_col + 2, &group.items, ""));
            lines
        }
    }
}

fn env_lines<'a>(
    pad: &'a str,
    env: &'a BTreeMap<String, String>,
) -> impl Iterator<Item = String> + 'a {
    env.iter()
        .map(move |(key, value)| format!("{}{}: {}", pad, scalar(key), scalar(value)))
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// A string as a single-line YAML scalar: plain or single-quoted when the
/// YAML emitter keeps it on one line, a JSON (double-quoted) string otherwise.
pub(crate) fn scalar(value: &str) -> String {
    match serde_yaml::to_string(value) {
        Ok(text) => {
            let text = text.strip_suffix('\n').unwrap_or(&text);
            if !text.contains('\n') && !text.is_empty() {
                return text.to_string();
            }
            json_string(value)
        }
        Err(_) => json_string(value),
    }
}

fn json_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}
