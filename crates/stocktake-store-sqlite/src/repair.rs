//! Repair of test results linked to templates outside their part's ancestry.
//!
//! An earlier data migration matched templates to test results by part tree
//! alone, so a result could end up pointing at a template owned by a part on
//! another branch of the same tree. Each such result is repointed to the
//! template with the same key on its deepest ancestor-or-self part, or, when
//! no ancestor defines the key, to a copy of its current template rehomed
//! under the result's own part.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use stocktake_core::{
    select_best_template, BadTestResult, PartId, RepairError, RepairOptions, RepairReport,
    TemplateCandidate, TemplateId, TestResultId, TreePosition,
};

use crate::{insert_template_row, load_template};

// SQLITE_MAX_VARIABLE_NUMBER of the bundled build; each updated row binds three values.
const MAX_BIND_VARIABLES: usize = 32_766;
const MAX_ROWS_PER_UPDATE: usize = MAX_BIND_VARIABLES / 3;

const BAD_RESULTS_FROM_SQL: &str = r"
FROM stock_stockitemtestresult r
JOIN stock_stockitem s ON s.id = r.stock_item_id
JOIN part_part p ON p.id = s.part_id
JOIN part_parttesttemplate t ON t.id = r.template_id
JOIN part_part tp ON tp.id = t.part_id
WHERE NOT (p.tree_id = tp.tree_id AND p.lft >= tp.lft AND p.rght <= tp.rght)
";

/// List test results whose template part is not an ancestor-or-self of the result's part.
///
/// # Errors
/// Returns an error when the detection query fails.
pub fn find_bad_test_results(conn: &Connection) -> Result<Vec<BadTestResult>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT r.id, r.template_id, t.key, p.id, p.tree_id, p.lft, p.rght, p.level
             {BAD_RESULTS_FROM_SQL}
             ORDER BY r.id ASC"
        ))
        .context("failed to prepare bad test result query")?;

    let rows = stmt.query_map([], |row| {
        Ok(BadTestResult {
            result_id: TestResultId(row.get(0)?),
            template_id: TemplateId(row.get(1)?),
            template_key: row.get(2)?,
            part_id: PartId(row.get(3)?),
            position: TreePosition {
                tree_id: row.get(4)?,
                lft: row.get(5)?,
                rght: row.get(6)?,
                level: row.get(7)?,
            },
        })
    })?;

    let mut bad = Vec::new();
    for row in rows {
        bad.push(row.context("failed to decode bad test result row")?);
    }
    Ok(bad)
}

/// # Errors
/// Returns an error when the count query fails.
pub fn count_bad_test_results(conn: &Connection) -> Result<usize> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) {BAD_RESULTS_FROM_SQL}"), [], |row| row.get(0))
        .context("failed to count bad test results")?;
    usize::try_from(count).context("bad test result count out of range")
}

/// Find the template for `key` owned by the deepest ancestor-or-self of `position`.
///
/// # Errors
/// Returns an error when the candidate query fails.
pub fn resolve_template(
    conn: &Connection,
    position: &TreePosition,
    key: &str,
) -> Result<Option<TemplateId>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT t.id, p.id, t.key, p.tree_id, p.lft, p.rght, p.level
             FROM part_parttesttemplate t
             JOIN part_part p ON p.id = t.part_id
             WHERE p.tree_id = ?1 AND p.lft <= ?2 AND p.rght >= ?3 AND t.key = ?4",
        )
        .context("failed to prepare template candidate query")?;

    let rows = stmt.query_map(params![position.tree_id, position.lft, position.rght, key], |row| {
        Ok(TemplateCandidate {
            template_id: TemplateId(row.get(0)?),
            part_id: PartId(row.get(1)?),
            key: row.get(2)?,
            position: TreePosition {
                tree_id: row.get(3)?,
                lft: row.get(4)?,
                rght: row.get(5)?,
                level: row.get(6)?,
            },
        })
    })?;

    let mut candidates = Vec::new();
    for row in rows {
        candidates.push(row.context("failed to decode template candidate row")?);
    }

    Ok(select_best_template(position, key, &candidates).map(|candidate| candidate.template_id))
}

/// Run detection, repoint-or-clone, and verification against `conn`.
///
/// The caller owns the transaction: on error nothing here may be committed.
pub(crate) fn repair_test_templates(
    conn: &Connection,
    options: &RepairOptions,
) -> Result<RepairReport> {
    let mut report = RepairReport::empty(options.dry_run);

    let bad = find_bad_test_results(conn)?;
    report.bad_results = bad.len();

    if bad.is_empty() {
        tracing::debug!(bad_results = 0, "no test results with bad templates");
        return Ok(report);
    }

    tracing::info!(bad_results = bad.len(), "found {} test results with bad templates", bad.len());

    // Resolve everything before writing so clones cannot shadow an existing match.
    let mut matched = Vec::new();
    let mut missing = Vec::new();
    for row in &bad {
        match resolve_template(conn, &row.position, &row.template_key)? {
            Some(template_id) => {
                if template_id != row.template_id {
                    matched.push((row.result_id, template_id));
                }
            }
            None => missing.push(row),
        }
    }

    if !matched.is_empty() {
        tracing::info!("updating {} matching templates", matched.len());
        bulk_update_templates(conn, &matched, options.batch_size)?;
    }
    report.repointed = matched.len();

    let mut attached = Vec::with_capacity(missing.len());
    for row in missing {
        // An earlier clone in this pass may already cover this part.
        let template_id = match resolve_template(conn, &row.position, &row.template_key)? {
            Some(template_id) => template_id,
            None => {
                let clone_id = clone_template_for_part(conn, row.template_id, row.part_id)?;
                report.created_templates.push(clone_id);
                clone_id
            }
        };
        attached.push((row.result_id, template_id));
    }

    if !attached.is_empty() {
        tracing::info!("updating {} missing templates", attached.len());
        bulk_update_templates(conn, &attached, options.batch_size)?;
    }
    report.attached_missing = attached.len();

    report.remaining = count_bad_test_results(conn)?;
    if report.remaining > 0 {
        tracing::error!(remaining = report.remaining, "test-template repair did not converge");
        return Err(RepairError::Unresolved { remaining: report.remaining }.into());
    }

    Ok(report)
}

fn clone_template_for_part(
    conn: &Connection,
    source: TemplateId,
    part_id: PartId,
) -> Result<TemplateId> {
    let template = load_template(conn, source)?
        .ok_or_else(|| anyhow!("template {source} vanished during repair"))?;
    let clone_id = insert_template_row(conn, &template.clone_for_part(part_id))?;
    tracing::info!(
        source = %source,
        template = %clone_id,
        part = %part_id,
        key = %template.key,
        "created template {clone_id} for part {part_id} (key {})",
        template.key
    );
    Ok(clone_id)
}

// One `UPDATE ... CASE` statement per chunk, mirroring an ORM bulk update.
fn bulk_update_templates(
    conn: &Connection,
    updates: &[(TestResultId, TemplateId)],
    batch_size: usize,
) -> Result<usize> {
    let mut written = 0;
    let chunk_len = batch_size.clamp(1, MAX_ROWS_PER_UPDATE);

    for chunk in updates.chunks(chunk_len) {
        let cases = "WHEN ? THEN ? ".repeat(chunk.len());
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "UPDATE stock_stockitemtestresult
             SET template_id = CASE id {cases}END
             WHERE id IN ({placeholders})"
        );

        let mut values = Vec::with_capacity(chunk.len() * 3);
        for (result_id, template_id) in chunk {
            values.push(result_id.0);
            values.push(template_id.0);
        }
        values.extend(chunk.iter().map(|(result_id, _)| result_id.0));

        written += conn
            .execute(&sql, params_from_iter(values))
            .context("failed to bulk update test result templates")?;
        tracing::debug!(rows = chunk.len(), "flushed template update batch");
    }

    Ok(written)
}
