//! Advertising data: a sequence of `length | AD type | data` structures

pub const AD_TYPE_MESH_MESSAGE: u8 = 0x2A;
pub const AD_TYPE_MESH_BEACON: u8 = 0x2B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Iterate the AD structures in an advertising payload.
///
/// Stops at a zero length (controller padding) and clamps a structure whose
/// declared length runs past the end of the payload.
pub fn ad_structures(adv: &[u8]) -> impl Iterator<Item = AdStructure<'_>> {
    let mut rest = adv;
    std::iter::from_fn(move || {
        let (&len, tail) = rest.split_first()?;
        let len = usize::from(len);
        if len == 0 || tail.is_empty() {
            rest = &[];
            return None;
        }
        let end = len.min(tail.len());
        let structure = AdStructure {
            ad_type: tail[0],
            data: &tail[1..end],
        };
        rest = &tail[end..];
        Some(structure)
    })
}
