//! Certification & config resolver (C8): one batched `ruleset ⋈ cert ⋈ deny`
//! join per call plus a hardcoded ruleset->region AFC-config lookup.

use std::collections::{HashMap, HashSet};

use als_model::cache::{AllowDeny, CertVerdict, RulesetCert};
use serde_json::Value;
use sqlx::{PgPool, Row};

/// Bit in `location_flags` marking a certification valid for outdoor deployment.
const OUTDOOR_FLAG: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertQuery {
    pub serial: String,
    pub certs: Vec<RulesetCert>,
}

struct DefinedCert {
    location_flags: i64,
}

/// Resolves certification allow/deny verdicts for a batch of queries with a
/// single round trip per table: one join across every distinct `(ruleset,
/// cert_id)` pair and every distinct serial in the batch, filtered per-query
/// afterward since the deny-list result set is over-complete by design.
pub async fn resolve_batch(
    pool: &PgPool,
    queries: &[CertQuery],
) -> Result<Vec<AllowDeny>, sqlx::Error> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }

    let mut rulesets = Vec::new();
    let mut cert_ids = Vec::new();
    let mut seen_pairs = HashSet::new();
    for q in queries {
        for c in &q.certs {
            if seen_pairs.insert((c.ruleset.clone(), c.cert_id.clone())) {
                rulesets.push(c.ruleset.clone());
                cert_ids.push(c.cert_id.clone());
            }
        }
    }
    let serials: Vec<String> = queries.iter().map(|q| q.serial.clone()).collect();

    let defined_rows = sqlx::query(
        "SELECT ruleset, cert_id, location_flags FROM certification_registry \
         WHERE (ruleset, cert_id) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))",
    )
    .bind(&rulesets)
    .bind(&cert_ids)
    .fetch_all(pool)
    .await?;
    let mut defined: HashMap<(String, String), DefinedCert> = HashMap::new();
    for row in defined_rows {
        let ruleset: String = row.try_get("ruleset")?;
        let cert_id: String = row.try_get("cert_id")?;
        let location_flags: i64 = row.try_get("location_flags")?;
        defined.insert((ruleset, cert_id), DefinedCert { location_flags });
    }

    let deny_rows = sqlx::query(
        "SELECT ruleset, cert_id, serial_number FROM certification_deny \
         WHERE (ruleset, cert_id) IN (SELECT * FROM UNNEST($1::text[], $2::text[])) \
           AND (serial_number IS NULL OR serial_number = ANY($3::text[]))",
    )
    .bind(&rulesets)
    .bind(&cert_ids)
    .bind(&serials)
    .fetch_all(pool)
    .await?;
    let mut deny: HashMap<(String, String), Vec<Option<String>>> = HashMap::new();
    for row in deny_rows {
        let ruleset: String = row.try_get("ruleset")?;
        let cert_id: String = row.try_get("cert_id")?;
        let serial_number: Option<String> = row.try_get("serial_number")?;
        deny.entry((ruleset, cert_id)).or_default().push(serial_number);
    }

    let special_rows = sqlx::query(
        "SELECT cert_id, serial_number, location_flags FROM special_certification \
         WHERE cert_id = ANY($1::text[]) AND serial_number = ANY($2::text[])",
    )
    .bind(&cert_ids)
    .bind(&serials)
    .fetch_all(pool)
    .await?;
    let mut special: HashMap<(String, String), i64> = HashMap::new();
    for row in special_rows {
        let cert_id: String = row.try_get("cert_id")?;
        let serial_number: String = row.try_get("serial_number")?;
        let location_flags: i64 = row.try_get("location_flags")?;
        special.insert((cert_id, serial_number), location_flags);
    }

    let mut out = Vec::with_capacity(queries.len());
    for q in queries {
        let mut verdicts = Vec::with_capacity(q.certs.len());
        for c in &q.certs {
            let key = (c.ruleset.clone(), c.cert_id.clone());
            let special_override = special.get(&(c.cert_id.clone(), q.serial.clone()));
            let cert_undefined = special_override.is_none() && !defined.contains_key(&key);
            let location_flags = special_override
                .copied()
                .or_else(|| defined.get(&key).map(|d| d.location_flags));
            let denies = deny.get(&key);
            let cert_denied = denies.map(|rows| rows.iter().any(Option::is_none)).unwrap_or(false);
            let serial_denied = denies
                .map(|rows| rows.iter().any(|s| s.as_deref() == Some(q.serial.as_str())))
                .unwrap_or(false);
            // "outdoor not allowed" has no dedicated CertVerdict field in the
            // shared cache types, so it folds into cert_denied.
            let outdoor_denied = location_flags.map(|f| f & OUTDOOR_FLAG == 0).unwrap_or(false);

            verdicts.push(CertVerdict {
                ruleset: c.ruleset.clone(),
                cert_id: c.cert_id.clone(),
                location_flags: location_flags.map(Value::from),
                cert_undefined,
                cert_denied: cert_denied || outdoor_denied,
                serial_denied,
            });
        }
        out.push(AllowDeny::from_verdicts(verdicts));
    }
    Ok(out)
}

/// Hardcoded ruleset -> region mapping used by the AFC-config resolver.
fn regions_for_ruleset(ruleset: &str) -> &'static [&'static str] {
    match ruleset {
        "US_47_CFR_PART_15_SUBPART_E" => &["US"],
        "CA_RES_DBS-06" => &["CA"],
        "BRAZIL_RULESETID" => &["BR"],
        _ => &[],
    }
}

/// Resolves the AFC config text for a ruleset via its mapped region(s).
/// Returns `None` when the ruleset has no region mapping or no config is on
/// file for any mapped region.
pub async fn resolve_config(pool: &PgPool, ruleset: &str) -> Result<Option<Value>, sqlx::Error> {
    let regions = regions_for_ruleset(ruleset);
    if regions.is_empty() {
        return Ok(None);
    }
    let regions: Vec<String> = regions.iter().map(|s| s.to_string()).collect();
    let row = sqlx::query(
        "SELECT config FROM afc_region_config WHERE config->>'regionStr' = ANY($1::text[]) LIMIT 1",
    )
    .bind(&regions)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Some(row.try_get("config")?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_ruleset_has_no_region_mapping() {
        assert!(regions_for_ruleset("NOT_A_RULESET").is_empty());
    }

    #[test]
    fn known_ruleset_maps_to_its_region() {
        assert_eq!(regions_for_ruleset("US_47_CFR_PART_15_SUBPART_E"), &["US"]);
    }
}
