//! Structural verification of HDU lists and the fix remedies.

use std::fmt;

use tracing::{debug, warn};

use crate::card::Card;
use crate::error::{Error, Result};
use crate::hdu::{Hdu, HduKind};
use crate::header::Header;
use crate::layout::{Check, Layout, Registry, Requirement};

/// What to do with verification findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyOption {
    /// Any finding is an error.
    #[default]
    Exception,
    /// Log findings and carry on.
    Warn,
    /// Apply every available remedy and log it; unfixable findings are errors.
    Fix,
    /// As [`VerifyOption::Fix`], without logging the remedies.
    SilentFix,
    /// Skip verification.
    Ignore,
}

impl VerifyOption {
    pub(crate) fn fixes(self) -> bool {
        matches!(self, VerifyOption::Fix | VerifyOption::SilentFix)
    }
}

/// One problem found by verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// `HDU n` or `HDU n, card m`.
    pub location: String,
    pub problem: String,
    /// A remedy exists.
    pub fixable: bool,
    /// The remedy was applied.
    pub fixed: bool,
}

impl Finding {
    fn new(location: String, problem: String, fixable: bool) -> Self {
        Finding {
            location,
            problem,
            fixable,
            fixed: false,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.problem)?;
        if self.fixed {
            f.write_str(" (fixed)")?;
        }
        Ok(())
    }
}

/// Verify a list of HDUs and act on the findings as `option` says.
///
/// Remedies are applied in place only under `Fix`/`SilentFix`, and never to
/// the first `frozen` HDUs. Returns every finding, fixed or not.
pub(crate) fn enforce(
    hdus: &mut Vec<Hdu>,
    registry: &Registry,
    option: VerifyOption,
    frozen: usize,
) -> Result<Vec<Finding>> {
    if option == VerifyOption::Ignore {
        return Ok(Vec::new());
    }
    let findings = verify_hdus(hdus, registry, option.fixes(), frozen)?;

    match option {
        VerifyOption::Exception if !findings.is_empty() => {
            return Err(failure(&findings));
        }
        VerifyOption::Warn => {
            for finding in &findings {
                warn!(location = %finding.location, "{}", finding.problem);
            }
        }
        VerifyOption::Fix | VerifyOption::SilentFix => {
            for finding in &findings {
                if option == VerifyOption::Fix {
                    warn!(location = %finding.location, fixed = finding.fixed, "{}", finding.problem);
                } else {
                    debug!(location = %finding.location, fixed = finding.fixed, "{}", finding.problem);
                }
            }
            let unfixed: Vec<Finding> = findings.iter().filter(|f| !f.fixed).cloned().collect();
            if !unfixed.is_empty() {
                return Err(failure(&unfixed));
            }
        }
        _ => {}
    }
    Ok(findings)
}

fn failure(findings: &[Finding]) -> Error {
    let lines: Vec<String> = findings.iter().map(Finding::to_string).collect();
    Error::Structural(format!("verification failed: {}", lines.join("; ")))
}

/// Collect findings for the whole list, fixing as we go when asked.
pub(crate) fn verify_hdus(
    hdus: &mut Vec<Hdu>,
    registry: &Registry,
    fix: bool,
    frozen: usize,
) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    if hdus.is_empty() {
        return Ok(findings);
    }

    if !hdus[0].kind.is_primary() {
        let mut finding = Finding::new(
            String::from("HDU 0"),
            format!("first HDU is {}, not a primary HDU", hdus[0].kind),
            true,
        );
        if fix && frozen == 0 {
            hdus.insert(0, Hdu::empty_primary()?);
            finding.fixed = true;
        }
        findings.push(finding);
    }

    for (index, hdu) in hdus.iter_mut().enumerate() {
        let location = format!("HDU {index}");
        let fix = fix && index >= frozen;
        if let HduKind::Corrupted { reason } = &hdu.kind {
            findings.push(Finding::new(location, format!("corrupted: {reason}"), false));
            continue;
        }
        if index > 0 && !hdu.kind.is_extension() {
            let convertible = hdu.kind == HduKind::Primary;
            let mut finding = Finding::new(
                location.clone(),
                format!("{} HDU is not allowed after the first position", hdu.kind),
                convertible,
            );
            if fix && convertible {
                hdu.make_extension()?;
                finding.fixed = true;
            }
            findings.push(finding);
        }

        findings.extend(verify_cards(&location, &mut hdu.header, fix)?);
        if let Some(layout) = registry.layout(hdu.kind.tag()) {
            findings.extend(verify_requirements(&location, &mut hdu.header, layout, fix)?);
        }
        if fix {
            hdu.kind = HduKind::classify(&hdu.header, registry);
        }
    }
    Ok(findings)
}

/// Opaque cards. The remedy upper-cases the keyword field and retries.
fn verify_cards(location: &str, header: &mut Header, fix: bool) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for index in 0..header.len() {
        let card = &header.cards()[index];
        let Some(reason) = card.opaque_reason() else {
            continue;
        };
        let image = card.image();
        let repaired = format!("{}{}", image[..8].to_ascii_uppercase(), &image[8..]);
        let repaired = Card::parse(repaired.as_bytes()).ok();
        let mut finding = Finding::new(
            format!("{location}, card {index}"),
            format!("unparsable card ({reason}): {}", image.trim_end()),
            repaired.is_some(),
        );
        if let (true, Some(card)) = (fix, repaired) {
            header.replace(index, card);
            finding.fixed = true;
        }
        findings.push(finding);
    }
    Ok(findings)
}

/// Walk a mandatory-keyword checklist in order.
fn verify_requirements(
    location: &str,
    header: &mut Header,
    layout: &dyn Layout,
    fix: bool,
) -> Result<Vec<Finding>> {
    let mut findings = Vec::new();
    for req in layout.requirements(header) {
        let Requirement {
            keyword,
            position,
            check,
            default,
        } = req;
        let keyword = keyword.as_str();

        let Some(found) = header.index_of(keyword) else {
            let mut finding = Finding::new(
                location.to_string(),
                format!("missing required keyword {keyword}"),
                default.is_some(),
            );
            if let (true, Some(value)) = (fix, default) {
                let card = Card::new(keyword, value, None)?;
                match position {
                    Some(position) => header.insert(position, card),
                    None => header.append(card),
                }
                finding.fixed = true;
            }
            findings.push(finding);
            continue;
        };

        let accepted = match header.cards()[found].value() {
            Some(value) => check.accepts(value),
            None => matches!(check, Check::Present),
        };
        if !accepted {
            let shown = header
                .value(found)
                .map_or_else(|| String::from("undefined"), |v| v.to_string());
            let mut finding = Finding::new(
                location.to_string(),
                format!("{keyword} = {shown} is not valid here"),
                default.is_some(),
            );
            if let (true, Some(value)) = (fix, default) {
                header.set(found, value)?;
                finding.fixed = true;
            }
            findings.push(finding);
        }

        if let Some(position) = position {
            if found != position {
                let mut finding = Finding::new(
                    location.to_string(),
                    format!("{keyword} is card {found}, must be card {position}"),
                    true,
                );
                if fix {
                    header.relocate(found, position);
                    finding.fixed = true;
                }
                findings.push(finding);
            }
        }
    }
    Ok(findings)
}
