//! Mapping between client field names and column names.

/// How client field names map onto backend column names.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldNaming {
    /// Column names equal field names.
    Identity,
    /// `parentId` in the client is `parent_id` in the database.
    #[default]
    CamelCase,
}

impl FieldNaming {
    pub fn to_db(self, field: &str) -> String {
        match self {
            FieldNaming::Identity => field.to_string(),
            FieldNaming::CamelCase => {
                let mut out = String::with_capacity(field.len() + 4);
                for ch in field.chars() {
                    if ch.is_ascii_uppercase() {
                        out.push('_');
                        out.push(ch.to_ascii_lowercase());
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }

    pub fn from_db(self, column: &str) -> String {
        match self {
            FieldNaming::Identity => column.to_string(),
            FieldNaming::CamelCase => {
                let mut out = String::with_capacity(column.len());
                let mut upper_next = false;
                for ch in column.chars() {
                    if ch == '_' && !out.is_empty() {
                        upper_next = true;
                    } else if upper_next {
                        out.push(ch.to_ascii_uppercase());
                        upper_next = false;
                    } else {
                        out.push(ch);
                    }
                }
                out
            }
        }
    }
}
