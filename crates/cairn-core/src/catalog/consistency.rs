use rusqlite::{params, Connection};

use crate::catalog::schema::{FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID};
use crate::error::{CairnError, Result};

/// Run the catalog invariant checks.
///
/// Returns a list of human-readable issues; empty means the catalog is
/// internally consistent. With `strict`, any issue is turned into a fatal
/// catalog-state error instead.
pub fn verify_consistency(
    conn: &Connection,
    blocksize: u32,
    block_hash_size: usize,
    strict: bool,
) -> Result<Vec<String>> {
    let mut issues = Vec::new();

    // block hashes must have the width of the configured digest
    // (unpadded base64: ceil(bytes * 8 / 6) characters)
    let expected_hash_len = (block_hash_size * 8).div_ceil(6);
    let bad_hashes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks WHERE LENGTH(hash) != ?1",
        params![expected_hash_len as i64],
        |row| row.get(0),
    )?;
    if bad_hashes > 0 {
        issues.push(format!("{bad_hashes} block(s) with malformed hash"));
    }

    // uniqueness: a hash may appear only once; two blocks with the same hash
    // (even with differing sizes) violate the interning contract
    let dup_hashes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM \
         (SELECT hash FROM blocks GROUP BY hash HAVING COUNT(*) > 1)",
        [],
        |row| row.get(0),
    )?;
    if dup_hashes > 0 {
        issues.push(format!("{dup_hashes} duplicated block hash(es)"));
    }

    // blockset length must equal the sum of its members' sizes
    let bad_lengths: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocksets bs \
         LEFT JOIN (SELECT be.blockset_id, SUM(b.size) AS total \
                    FROM blockset_entries be JOIN blocks b ON b.id = be.block_id \
                    GROUP BY be.blockset_id) agg ON agg.blockset_id = bs.id \
         WHERE COALESCE(agg.total, 0) != bs.length",
        [],
        |row| row.get(0),
    )?;
    if bad_lengths > 0 {
        issues.push(format!(
            "{bad_lengths} blockset(s) whose length disagrees with their blocks"
        ));
    }

    // every block but the last in a blockset must be exactly blocksize
    let bad_interior: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blockset_entries be \
         JOIN blocks b ON b.id = be.block_id \
         JOIN (SELECT blockset_id, MAX(idx) AS last_idx FROM blockset_entries \
               GROUP BY blockset_id) tail ON tail.blockset_id = be.blockset_id \
         WHERE be.idx < tail.last_idx AND b.size != ?1",
        params![blocksize as i64],
        |row| row.get(0),
    )?;
    if bad_interior > 0 {
        issues.push(format!(
            "{bad_interior} non-terminal block(s) not equal to the configured blocksize"
        ));
    }

    // referential integrity: files -> blocksets
    let dangling_content: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE blockset_id > 0 \
         AND blockset_id NOT IN (SELECT id FROM blocksets)",
        [],
        |row| row.get(0),
    )?;
    if dangling_content > 0 {
        issues.push(format!(
            "{dangling_content} file(s) referencing a missing content blockset"
        ));
    }
    let dangling_meta: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE metadata_id > 0 \
         AND metadata_id NOT IN (SELECT id FROM blocksets)",
        [],
        |row| row.get(0),
    )?;
    if dangling_meta > 0 {
        issues.push(format!(
            "{dangling_meta} file(s) referencing a missing metadata blockset"
        ));
    }
    let bad_sentinels: i64 = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE blockset_id <= 0 \
         AND blockset_id NOT IN (?1, ?2)",
        params![FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID],
        |row| row.get(0),
    )?;
    if bad_sentinels > 0 {
        issues.push(format!("{bad_sentinels} file(s) with an unknown sentinel id"));
    }

    // referential integrity: fileset entries -> files
    let dangling_entries: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fileset_entries \
         WHERE file_id NOT IN (SELECT id FROM files)",
        [],
        |row| row.get(0),
    )?;
    if dangling_entries > 0 {
        issues.push(format!(
            "{dangling_entries} fileset entr(ies) referencing a missing file"
        ));
    }

    // referential integrity: filesets -> remote volumes, which must be live
    let dangling_filesets: i64 = conn.query_row(
        "SELECT COUNT(*) FROM filesets fs \
         LEFT JOIN remote_volumes rv ON rv.id = fs.volume_id \
         WHERE rv.id IS NULL OR rv.state IN ('deleting', 'deleted')",
        [],
        |row| row.get(0),
    )?;
    if dangling_filesets > 0 {
        issues.push(format!(
            "{dangling_filesets} fileset(s) without a live dfileset volume"
        ));
    }

    // referential integrity: blocks -> remote volumes
    let dangling_blocks: i64 = conn.query_row(
        "SELECT COUNT(*) FROM blocks \
         WHERE volume_id NOT IN (SELECT id FROM remote_volumes)",
        [],
        |row| row.get(0),
    )?;
    if dangling_blocks > 0 {
        issues.push(format!(
            "{dangling_blocks} block(s) referencing a missing dblock volume"
        ));
    }

    // fileset timestamps must be strictly increasing in id order
    let order_violations: i64 = conn.query_row(
        "SELECT COUNT(*) FROM filesets f1 JOIN filesets f2 \
         ON f2.id > f1.id AND f2.timestamp <= f1.timestamp",
        [],
        |row| row.get(0),
    )?;
    if order_violations > 0 {
        issues.push(format!(
            "{order_violations} fileset pair(s) violating timestamp monotonicity"
        ));
    }

    if strict {
        if let Some(first) = issues.first() {
            return Err(CairnError::CatalogState(format!(
                "inconsistent ({first}{})",
                if issues.len() > 1 {
                    format!(" and {} more issue(s)", issues.len() - 1)
                } else {
                    String::new()
                }
            )));
        }
    }
    Ok(issues)
}
