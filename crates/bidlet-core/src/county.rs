//! County decoding from proposal identifiers.

use std::collections::{BTreeMap, BTreeSet};

/// Proposal-id county numbering: the 83 Michigan counties in alphabetical
/// order, followed by the Detroit City pseudo-county.
pub const MICHIGAN_COUNTIES: [(u8, &str); 84] = [
    (1, "Alcona"),
    (2, "Alger"),
    (3, "Allegan"),
    (4, "Alpena"),
    (5, "Antrim"),
    (6, "Arenac"),
    (7, "Baraga"),
    (8, "Barry"),
    (9, "Bay"),
    (10, "Benzie"),
    (11, "Berrien"),
    (12, "Branch"),
    (13, "Calhoun"),
    (14, "Cass"),
    (15, "Charlevoix"),
    (16, "Cheboygan"),
    (17, "Chippewa"),
    (18, "Clare"),
    (19, "Clinton"),
    (20, "Crawford"),
    (21, "Delta"),
    (22, "Dickinson"),
    (23, "Eaton"),
    (24, "Emmet"),
    (25, "Genesee"),
    (26, "Gladwin"),
    (27, "Gogebic"),
    (28, "Grand Traverse"),
    (29, "Gratiot"),
    (30, "Hillsdale"),
    (31, "Houghton"),
    (32, "Huron"),
    (33, "Ingham"),
    (34, "Ionia"),
    (35, "Iosco"),
    (36, "Iron"),
    (37, "Isabella"),
    (38, "Jackson"),
    (39, "Kalamazoo"),
    (40, "Kalkaska"),
    (41, "Kent"),
    (42, "Keweenaw"),
    (43, "Lake"),
    (44, "Lapeer"),
    (45, "Leelanau"),
    (46, "Lenawee"),
    (47, "Livingston"),
    (48, "Luce"),
    (49, "Mackinac"),
    (50, "Macomb"),
    (51, "Manistee"),
    (52, "Marquette"),
    (53, "Mason"),
    (54, "Mecosta"),
    (55, "Menominee"),
    (56, "Midland"),
    (57, "Missaukee"),
    (58, "Monroe"),
    (59, "Montcalm"),
    (60, "Montmorency"),
    (61, "Muskegon"),
    (62, "Newaygo"),
    (63, "Oakland"),
    (64, "Oceana"),
    (65, "Ogemaw"),
    (66, "Ontonagon"),
    (67, "Osceola"),
    (68, "Oscoda"),
    (69, "Otsego"),
    (70, "Ottawa"),
    (71, "Presque Isle"),
    (72, "Roscommon"),
    (73, "Saginaw"),
    (74, "St. Clair"),
    (75, "St. Joseph"),
    (76, "Sanilac"),
    (77, "Schoolcraft"),
    (78, "Shiawassee"),
    (79, "Tuscola"),
    (80, "Van Buren"),
    (81, "Washtenaw"),
    (82, "Wayne"),
    (83, "Wexford"),
    (84, "Detroit City"),
];

/// Immutable code -> county lookup, built once and passed to whoever needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountyTable {
    by_code: BTreeMap<u8, String>,
}

impl CountyTable {
    pub fn michigan() -> Self {
        Self::from_entries(MICHIGAN_COUNTIES.iter().map(|(code, name)| (*code, *name)))
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u8, S)>,
        S: Into<String>,
    {
        Self {
            by_code: entries.into_iter().map(|(c, n)| (c, n.into())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Numeric county code carried by the first two characters of a proposal id.
    ///
    /// A single leading digit followed by a non-digit is read as zero-padded
    /// (`"7-123"` -> 7). Anything else yields `None`.
    pub fn code_of(proposal_id: &str) -> Option<u8> {
        let mut chars = proposal_id.trim_start().chars();
        let first = chars.next()?.to_digit(10)?;
        match chars.next().and_then(|c| c.to_digit(10)) {
            Some(second) => u8::try_from(first * 10 + second).ok(),
            None => u8::try_from(first).ok(),
        }
    }

    /// County name for a proposal id, or `None` when the code is unmapped.
    pub fn decode(&self, proposal_id: &str) -> Option<&str> {
        let code = Self::code_of(proposal_id)?;
        self.by_code.get(&code).map(String::as_str)
    }

    /// Two-digit, zero-padded code for a county name (case-insensitive).
    pub fn code_for(&self, county: &str) -> Option<String> {
        let wanted = county.trim();
        self.by_code
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(wanted))
            .map(|(code, _)| format!("{code:02}"))
    }

    /// Codes for every known county name in `names`; unknown names are ignored.
    pub fn codes_for<'a, I>(&self, names: I) -> BTreeSet<u8>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let wanted = names
            .into_iter()
            .map(|n| n.trim().to_ascii_lowercase())
            .collect::<BTreeSet<_>>();
        self.by_code
            .iter()
            .filter(|(_, name)| wanted.contains(&name.to_ascii_lowercase()))
            .map(|(code, _)| *code)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.by_code.iter().map(|(c, n)| (*c, n.as_str()))
    }
}

impl Default for CountyTable {
    fn default() -> Self {
        Self::michigan()
    }
}
