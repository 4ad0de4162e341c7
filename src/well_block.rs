//! Well-ID arithmetic and the `A01:D04;E01` block notation.
//!
//! Coordinates are zero-based `(row, column)` pairs; the textual form uses
//! bijective base-26 row letters (A..Z, AA..) and 1-based, zero-padded
//! column numbers.

use crate::error::{EchoError, Result};
use echo_protocol::Direction;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};

pub type Coords = (usize, usize);

const MAX_ROW_LETTERS: usize = 3;

/// Rows and columns of the largest supported plate (1536 wells). Ranges
/// reaching past it are rejected before expansion.
pub const MAX_PLATE_ROWS: usize = 32;
pub const MAX_PLATE_COLUMNS: usize = 48;

lazy_static! {
    static ref WELL_ID: Regex = Regex::new(r"^([A-Z]{1,3})([0-9]{1,4})$").expect("valid regex");
}

pub fn row_label(row: usize) -> String {
    let mut n = row + 1;
    let mut letters = vec![];
    while n > 0 {
        n -= 1;
        letters.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

pub fn row_index(label: &str) -> Option<usize> {
    if label.is_empty() || label.len() > MAX_ROW_LETTERS {
        return None;
    }
    let mut acc = 0usize;
    for c in label.bytes() {
        if !c.is_ascii_uppercase() {
            return None;
        }
        acc = acc * 26 + (c - b'A' + 1) as usize;
    }
    Some(acc - 1)
}

pub fn well_id_from_coords(row: usize, col: usize) -> String {
    format!("{}{:02}", row_label(row), col + 1)
}

pub fn coords_from_well_id(well_id: &str) -> Result<Coords> {
    let norm = well_id.trim().to_ascii_uppercase();
    let caps = WELL_ID
        .captures(&norm)
        .ok_or_else(|| EchoError::Format(well_id.to_string()))?;
    let row = row_index(&caps[1]).ok_or_else(|| EchoError::Format(well_id.to_string()))?;
    let col: usize = caps[2]
        .parse()
        .map_err(|_| EchoError::Format(well_id.to_string()))?;
    if col == 0 {
        return Err(EchoError::Format(well_id.to_string()));
    }
    Ok((row, col - 1))
}

fn format_rect(top_left: Coords, bottom_right: Coords) -> String {
    if top_left == bottom_right {
        well_id_from_coords(top_left.0, top_left.1)
    } else {
        format!(
            "{}:{}",
            well_id_from_coords(top_left.0, top_left.1),
            well_id_from_coords(bottom_right.0, bottom_right.1)
        )
    }
}

/// Covers a set of wells with axis-aligned rectangles and writes them as
/// `TL:BR` / single-well tokens joined by `;`.
///
/// Greedy: anchors are taken in (row, column) order and each anchor grows
/// the largest rectangle of still-uncovered wells. Deterministic, exact,
/// not globally minimal.
pub fn format_well_block<S: AsRef<str>>(well_ids: &[S]) -> Result<String> {
    let cells = well_ids
        .iter()
        .map(|id| coords_from_well_id(id.as_ref()))
        .collect::<Result<BTreeSet<Coords>>>()?;
    let mut covered: HashSet<Coords> = HashSet::new();
    let mut parts: Vec<String> = vec![];

    for &(r0, c0) in &cells {
        if covered.contains(&(r0, c0)) {
            continue;
        }
        let available = |r: usize, c: usize| cells.contains(&(r, c)) && !covered.contains(&(r, c));

        let mut max_width = 0;
        while available(r0, c0 + max_width) {
            max_width += 1;
        }

        let (mut best_w, mut best_h) = (1, 1);
        let mut height_limit = usize::MAX;
        for w in 1..=max_width {
            let mut h = 0;
            while h < height_limit && (0..w).all(|dc| available(r0 + h, c0 + dc)) {
                h += 1;
            }
            height_limit = h;
            if w * h > best_w * best_h {
                (best_w, best_h) = (w, h);
            }
        }

        for r in r0..r0 + best_h {
            for c in c0..c0 + best_w {
                covered.insert((r, c));
            }
        }
        parts.push(format_rect((r0, c0), (r0 + best_h - 1, c0 + best_w - 1)));
    }

    Ok(parts.join(";"))
}

/// Splits a block string into its `;`-separated tokens.
pub fn split_blocks(raw_range: &str) -> Vec<String> {
    raw_range
        .split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_token(token: &str) -> Result<(Coords, Coords)> {
    let bad = || EchoError::InvalidRange(token.to_string());
    let parts = token.split(':').map(|s| s.trim()).collect::<Vec<_>>();
    let (top_left, bottom_right) = match parts.as_slice() {
        [single] => {
            let c = coords_from_well_id(single).map_err(|_| bad())?;
            (c, c)
        }
        [start, end] => {
            let a = coords_from_well_id(start).map_err(|_| bad())?;
            let b = coords_from_well_id(end).map_err(|_| bad())?;
            ((a.0.min(b.0), a.1.min(b.1)), (a.0.max(b.0), a.1.max(b.1)))
        }
        _ => return Err(bad()),
    };
    if bottom_right.0 >= MAX_PLATE_ROWS || bottom_right.1 >= MAX_PLATE_COLUMNS {
        return Err(bad());
    }
    Ok((top_left, bottom_right))
}

pub fn get_some_wells_coords(raw_range: &str) -> Result<Vec<Coords>> {
    let mut ret = vec![];
    for token in split_blocks(raw_range) {
        let ((r0, c0), (r1, c1)) = parse_token(&token)?;
        for r in r0..=r1 {
            for c in c0..=c1 {
                ret.push((r, c));
            }
        }
    }
    Ok(ret)
}

/// Expands block notation into the literal, row-major list of well IDs.
pub fn get_some_wells(raw_range: &str) -> Result<Vec<String>> {
    Ok(get_some_wells_coords(raw_range)?
        .into_iter()
        .map(|(r, c)| well_id_from_coords(r, c))
        .collect())
}

fn scan_key(coords: Coords, direction: Direction) -> Coords {
    if direction.is_horizontal() {
        coords
    } else {
        (coords.1, coords.0)
    }
}

/// Distributes the wells of a block over `concentration_count` slots.
///
/// The block is linearised along `direction` (row-major for LR/RL,
/// column-major for TB/BT, reversed for RL/BT) and well `i` goes to slot
/// `i % concentration_count`, so replicates of one concentration are spread
/// periodically instead of stacked. Each slot's wells come back in reading
/// order for the direction's axis.
pub fn map_wells_to_concentrations(
    well_block: &str,
    concentration_count: usize,
    direction: Direction,
) -> Result<Vec<Vec<String>>> {
    if concentration_count == 0 {
        return Ok(vec![]);
    }
    let mut ordered = get_some_wells_coords(well_block)?;
    ordered.sort_by_key(|c| scan_key(*c, direction));
    ordered.dedup();
    if direction.is_reversed() {
        ordered.reverse();
    }

    let mut slots: Vec<Vec<Coords>> = vec![vec![]; concentration_count];
    for (i, coords) in ordered.into_iter().enumerate() {
        slots[i % concentration_count].push(coords);
    }
    Ok(slots
        .into_iter()
        .map(|mut slot| {
            slot.sort_by_key(|c| scan_key(*c, direction));
            slot.into_iter()
                .map(|(r, c)| well_id_from_coords(r, c))
                .collect()
        })
        .collect())
}
