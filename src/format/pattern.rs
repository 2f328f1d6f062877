//! Formats described entirely by file-name patterns.
//!
//! A primary glob selects the group's anchor file; dependency templates
//! (`{stem}` and `{name}` expand from the primary) are looked up beside it.

use glob::Pattern;
use std::path::PathBuf;

use super::{FilterContext, FilterOutcome, FilterVerdict, FormatDescriptor, ImportFilter};
use crate::actions::MoveParser;
use crate::config::PatternFormatConfig;
use crate::error::{Error, FilterError};
use crate::folder::{self, ImportFile, ImportFolder};
use crate::properties::Properties;

#[derive(Debug, Clone)]
pub struct PatternFilter {
    primary: Pattern,
    required: Vec<String>,
    optional: Vec<String>,
    discard_empty: bool,
}

impl PatternFilter {
    pub fn new(
        primary: &str,
        required: Vec<String>,
        optional: Vec<String>,
        discard_empty: bool,
    ) -> Result<Self, Error> {
        let primary = folder::name_pattern(primary)?;
        Ok(Self {
            primary,
            required,
            optional,
            discard_empty,
        })
    }

    pub fn from_config(config: &PatternFormatConfig) -> Result<Self, Error> {
        Self::new(
            &config.primary,
            config.required.clone(),
            config.optional.clone(),
            config.discard_empty,
        )
    }
}

impl ImportFilter for PatternFilter {
    fn evaluate(&self, ctx: &FilterContext<'_>) -> Result<FilterOutcome, FilterError> {
        let primary = ctx.primary();
        if !folder::name_matches(&self.primary, primary.name()) {
            return Ok(FilterOutcome::none());
        }

        if self.discard_empty && primary.size() == 0 {
            return Ok(FilterOutcome::discard(format!(
                "primary file '{}' is empty",
                primary.name()
            )));
        }

        let folder = ctx.primary_folder().ok_or_else(|| {
            FilterError::Fault(format!(
                "folder '{}' missing from snapshot",
                primary.folder_path()
            ))
        })?;

        let mut found = Vec::new();
        let mut missing_required = Vec::new();
        let mut missing_optional = Vec::new();

        for template in &self.required {
            let expanded = expand(template, primary);
            if !resolve_into(folder, &expanded, primary, &mut found) {
                missing_required.push(expanded);
            }
        }
        for template in &self.optional {
            let expanded = expand(template, primary);
            if !resolve_into(folder, &expanded, primary, &mut found) {
                missing_optional.push(expanded);
            }
        }

        let verdict = if !missing_required.is_empty() {
            FilterVerdict::RetryOrDiscard
        } else if !missing_optional.is_empty() {
            FilterVerdict::RetryOrImport
        } else {
            FilterVerdict::Import
        };

        let mut outcome = FilterOutcome::new(verdict);
        outcome.dependencies = found;
        outcome.missing = missing_required
            .into_iter()
            .chain(missing_optional)
            .collect();
        Ok(outcome)
    }
}

fn expand(template: &str, primary: &ImportFile) -> String {
    template
        .replace("{stem}", primary.stem())
        .replace("{name}", primary.name())
}

/// Resolve one dependency name in `folder`, pushing hits into `found`.
/// Returns whether anything other than the primary matched.
fn resolve_into(
    folder: &ImportFolder,
    name: &str,
    primary: &ImportFile,
    found: &mut Vec<String>,
) -> bool {
    let mut matched = false;
    if name.contains(|c: char| c == '*' || c == '?') {
        for file in folder.find_files(name) {
            if file.relative_path() == primary.relative_path() {
                continue;
            }
            matched = true;
            if !found.iter().any(|f| f == file.relative_path()) {
                found.push(file.relative_path().to_string());
            }
        }
    } else if let Some(file) = folder.find_file(name) {
        if file.relative_path() != primary.relative_path() {
            matched = true;
            if !found.iter().any(|f| f == file.relative_path()) {
                found.push(file.relative_path().to_string());
            }
        }
    }
    matched
}

/// Build a registrable format from its configuration. Formats with an
/// `output_dir` get a parser that moves imported files there.
pub fn pattern_format(config: &PatternFormatConfig) -> Result<FormatDescriptor, Error> {
    let filter = PatternFilter::from_config(config)?;
    let properties: Properties = config
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut descriptor = FormatDescriptor::new(&config.id, config.priority, move || {
        Box::new(filter.clone())
    })
    .with_properties(properties);

    if let Some(output_dir) = &config.output_dir {
        let target = PathBuf::from(output_dir);
        descriptor = descriptor.with_parser(move || Box::new(MoveParser::new(target.clone())));
    }

    Ok(descriptor)
}
