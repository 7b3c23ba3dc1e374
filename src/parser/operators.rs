//! Closed operator and stage vocabularies
//!
//! Every `$`-prefixed key accepted by the compiler maps to exactly one
//! variant; anything else is rejected at the lookup.

use std::fmt;

macro_rules! operator_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn parse(key: &str) -> Option<Self> {
                match key {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

operator_enum! {
    /// Operators accepted inside `where` and `$match`
    MatchOperator {
        Eq => "$eq",
        Ne => "$ne",
        Gt => "$gt",
        Gte => "$gte",
        Lt => "$lt",
        Lte => "$lte",
        In => "$in",
        Nin => "$nin",
        Exists => "$exists",
        Type => "$type",
        Not => "$not",
        And => "$and",
        Or => "$or",
        Regex => "$regex",
        All => "$all",
        Size => "$size",
        ElemMatch => "$elemMatch",
        Within => "$within",
        Intersects => "$intersects",
        Near => "$near",
        NearSphere => "$nearSphere",
    }
}

operator_enum! {
    /// Operators of the group expression algebra
    GroupOperator {
        String => "$string",
        Number => "$number",
        Integer => "$integer",
        Boolean => "$boolean",
        Date => "$date",
        ObjectId => "$objectId",
        Array => "$array",
        And => "$and",
        Or => "$or",
        Not => "$not",
        SetEquals => "$setEquals",
        SetIntersection => "$setIntersection",
        SetUnion => "$setUnion",
        SetDifference => "$setDifference",
        SetIsSubset => "$setIsSubset",
        AnyElementTrue => "$anyElementTrue",
        AllElementsTrue => "$allElementsTrue",
        Cmp => "$cmp",
        Eq => "$eq",
        Gt => "$gt",
        Gte => "$gte",
        Lt => "$lt",
        Lte => "$lte",
        Ne => "$ne",
        Add => "$add",
        Multiply => "$multiply",
        Subtract => "$subtract",
        Divide => "$divide",
        Mod => "$mod",
        Concat => "$concat",
        Substr => "$substr",
        ToLower => "$toLower",
        ToUpper => "$toUpper",
        Strcasecmp => "$strcasecmp",
        Size => "$size",
        DayOfYear => "$dayOfYear",
        DayOfMonth => "$dayOfMonth",
        DayOfWeek => "$dayOfWeek",
        Year => "$year",
        Month => "$month",
        Week => "$week",
        Hour => "$hour",
        Minute => "$minute",
        Second => "$second",
        Millisecond => "$millisecond",
        DateToString => "$dateToString",
        Cond => "$cond",
        IfNull => "$ifNull",
    }
}

operator_enum! {
    /// Group accumulators
    Accumulator {
        Count => "$count",
        Sum => "$sum",
        Avg => "$avg",
        First => "$first",
        Last => "$last",
        Min => "$min",
        Max => "$max",
        Push => "$push",
        PushAll => "$pushAll",
        AddToSet => "$addToSet",
    }
}

operator_enum! {
    /// Pipeline stage names
    StageName {
        Match => "$match",
        Sort => "$sort",
        Group => "$group",
        Project => "$project",
        Unwind => "$unwind",
        Skip => "$skip",
        Limit => "$limit",
        AddFields => "$addFields",
        Lookup => "$lookup",
        GraphLookup => "$graphLookup",
        Bucket => "$bucket",
        BucketAuto => "$bucketAuto",
        Count => "$count",
        Facet => "$facet",
        GeoNear => "$geoNear",
        Redact => "$redact",
        ReplaceRoot => "$replaceRoot",
        Sample => "$sample",
        SortByCount => "$sortByCount",
    }
}

impl MatchOperator {
    /// Operators satisfied by the absence of a value
    pub fn is_negative(&self) -> bool {
        matches!(self, MatchOperator::Ne | MatchOperator::Nin | MatchOperator::Not)
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            MatchOperator::Eq
                | MatchOperator::Ne
                | MatchOperator::Gt
                | MatchOperator::Gte
                | MatchOperator::Lt
                | MatchOperator::Lte
        )
    }
}

impl GroupOperator {
    pub fn is_date_part(&self) -> bool {
        matches!(
            self,
            GroupOperator::DayOfYear
                | GroupOperator::DayOfMonth
                | GroupOperator::DayOfWeek
                | GroupOperator::Year
                | GroupOperator::Month
                | GroupOperator::Week
                | GroupOperator::Hour
                | GroupOperator::Minute
                | GroupOperator::Second
                | GroupOperator::Millisecond
        )
    }
}

impl StageName {
    /// Stages accepted by a regular (non-native) pipeline
    pub fn is_core(&self) -> bool {
        matches!(
            self,
            StageName::Match
                | StageName::Sort
                | StageName::Group
                | StageName::Project
                | StageName::Unwind
                | StageName::Skip
                | StageName::Limit
        )
    }
}

/// An operator frame on a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOperator {
    Match(MatchOperator),
    Group(GroupOperator),
    Accumulator(Accumulator),
}

impl ChainOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainOperator::Match(op) => op.as_str(),
            ChainOperator::Group(op) => op.as_str(),
            ChainOperator::Accumulator(op) => op.as_str(),
        }
    }
}

impl From<MatchOperator> for ChainOperator {
    fn from(op: MatchOperator) -> Self {
        ChainOperator::Match(op)
    }
}

impl From<GroupOperator> for ChainOperator {
    fn from(op: GroupOperator) -> Self {
        ChainOperator::Group(op)
    }
}

impl From<Accumulator> for ChainOperator {
    fn from(op: Accumulator) -> Self {
        ChainOperator::Accumulator(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip_names() {
        for op in MatchOperator::ALL {
            assert_eq!(MatchOperator::parse(op.as_str()), Some(*op));
        }
        for op in GroupOperator::ALL {
            assert_eq!(GroupOperator::parse(op.as_str()), Some(*op));
        }
    }

    #[test]
    fn test_unknown_operator() {
        assert_eq!(MatchOperator::parse("$where"), None);
        assert_eq!(StageName::parse("$out"), None);
    }

    #[test]
    fn test_core_stages() {
        assert!(StageName::Unwind.is_core());
        assert!(!StageName::Lookup.is_core());
        assert!(!StageName::AddFields.is_core());
    }
}
