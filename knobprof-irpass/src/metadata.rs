//! Debug-info metadata scraping.
//!
//! `llvm-ir` parses instruction structure and the `!dbg` source location
//! attached to each instruction, but it does not model the metadata graph
//! itself (`DILocalVariable`, `DIDerivedType`, `DICompositeType`, ...). That
//! graph is exactly what the taint/structure analysis needs to recover a
//! human variable name, its declared type, and (for class-member taint
//! matches) a struct's field names. Rather than hand-roll a second IR
//! parser, this module scrapes the node definitions straight out of the
//! module's textual form with `regex` -- each metadata node is one line of
//! the form `!N = [distinct] !DIKind(key: value, ...)`, which is regular
//! enough to pull apart without a real parser.
//!
//! Only textual (`.ll`) modules carry this information; bitcode inputs are
//! out of scope for this pass (see `main.rs`).

use std::collections::HashMap;

use regex::Regex;

#[derive(Debug, Clone)]
pub struct DebugVariable {
    pub name: String,
    pub directory: String,
    pub file: String,
    pub line: u32,
    pub type_name: String,
}

struct MetaNode {
    kind: String,
    body: String,
}

pub struct DebugInfo {
    nodes: HashMap<u32, MetaNode>,
    tuples: HashMap<u32, Vec<u32>>,
    /// SSA register name (as it appears in `llvm.dbg.{declare,value}`) to
    /// the `DILocalVariable` metadata id it names.
    declared: HashMap<String, u32>,
    /// Struct/class type name (as it appears on a `getelementptr` base
    /// pointer, e.g. `%struct.Foo`) to its `DICompositeType` metadata id.
    composite_by_name: HashMap<String, u32>,
}

impl DebugInfo {
    pub fn scrape(ir_text: &str) -> Self {
        let node_re = Regex::new(r"^!(\d+) = (?:distinct )?!(DI\w+)\((.*)\)\s*$").unwrap();
        let tuple_re = Regex::new(r"^!(\d+) = (?:distinct )?!\{(.*)\}\s*$").unwrap();
        let tuple_ref_re = Regex::new(r"!(\d+)").unwrap();
        let dbg_re =
            Regex::new(r"call\s+void\s+@llvm\.dbg\.(?:declare|value)\(metadata[^,]*?(%[\w.]+)[^,]*,\s*metadata !(\d+)")
                .unwrap();

        let mut nodes = HashMap::new();
        let mut tuples = HashMap::new();
        let mut declared = HashMap::new();

        for line in ir_text.lines() {
            let line = line.trim();
            if let Some(caps) = node_re.captures(line) {
                let id: u32 = caps[1].parse().unwrap();
                nodes.insert(
                    id,
                    MetaNode {
                        kind: caps[2].to_string(),
                        body: caps[3].to_string(),
                    },
                );
            } else if let Some(caps) = tuple_re.captures(line) {
                let id: u32 = caps[1].parse().unwrap();
                let refs = tuple_ref_re
                    .captures_iter(&caps[2])
                    .map(|c| c[1].parse().unwrap())
                    .collect();
                tuples.insert(id, refs);
            }
            if let Some(caps) = dbg_re.captures(line) {
                let ssa = caps[1].to_string();
                let var_id: u32 = caps[2].parse().unwrap();
                declared.insert(ssa, var_id);
            }
        }

        let mut composite_by_name = HashMap::new();
        for (&id, node) in &nodes {
            if node.kind == "DICompositeType" {
                if let Some(name) = field(&node.body, "name") {
                    composite_by_name.insert(name.to_string(), id);
                }
            }
        }

        DebugInfo {
            nodes,
            tuples,
            declared,
            composite_by_name,
        }
    }

    /// Resolves the `DILocalVariable` tied to an `llvm.dbg.{declare,value}`
    /// call whose tracked SSA register is `ssa_name`, e.g. `%x.addr`.
    pub fn variable_for_ssa(&self, ssa_name: &str) -> Option<DebugVariable> {
        let var_id = *self.declared.get(ssa_name)?;
        self.local_variable(var_id)
    }

    fn local_variable(&self, id: u32) -> Option<DebugVariable> {
        let node = self.nodes.get(&id)?;
        if node.kind != "DILocalVariable" && node.kind != "DIDerivedType" {
            return None;
        }
        let name = field(&node.body, "name")?.to_string();
        let file_id: u32 = field(&node.body, "file")?.trim_start_matches('!').parse().ok()?;
        let (directory, file) = self.file_parts(file_id);
        let line = field(&node.body, "line").and_then(|s| s.parse().ok()).unwrap_or(0);
        let type_name = field(&node.body, "type")
            .and_then(|s| s.trim_start_matches('!').parse::<u32>().ok())
            .map(|tid| self.type_name(tid))
            .unwrap_or_else(|| "uintptr".to_string());
        Some(DebugVariable {
            name,
            directory,
            file,
            line,
            type_name,
        })
    }

    fn file_parts(&self, file_id: u32) -> (String, String) {
        self.nodes
            .get(&file_id)
            .map(|n| {
                let dir = field(&n.body, "directory").unwrap_or("").to_string();
                let file = field(&n.body, "filename").unwrap_or("").to_string();
                (dir, file)
            })
            .unwrap_or_default()
    }

    fn type_name(&self, id: u32) -> String {
        match self.nodes.get(&id) {
            Some(node) => field(&node.body, "name")
                .filter(|n| !n.is_empty())
                .map(|n| n.replace(' ', "#"))
                .or_else(|| {
                    field(&node.body, "baseType")
                        .and_then(|s| s.trim_start_matches('!').parse::<u32>().ok())
                        .map(|bt| self.type_name(bt))
                })
                .unwrap_or_else(|| "uintptr".to_string()),
            None => "uintptr".to_string(),
        }
    }

    /// Resolves field `index` of the struct/class type named `struct_name`
    /// (the LLVM type name as it appears on a `getelementptr` base pointer,
    /// e.g. `struct.Foo`), returning that field's debug variable record.
    pub fn class_field(&self, struct_name: &str, index: usize) -> Option<DebugVariable> {
        let short_name = struct_name.rsplit('.').next().unwrap_or(struct_name);
        let composite_id = *self
            .composite_by_name
            .get(struct_name)
            .or_else(|| self.composite_by_name.get(short_name))?;
        let composite = self.nodes.get(&composite_id)?;
        let elements_id: u32 = field(&composite.body, "elements")?.trim_start_matches('!').parse().ok()?;
        let member_id = *self.tuples.get(&elements_id)?.get(index)?;
        self.local_variable(member_id)
    }
}

fn field<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let pat = format!("{key}: ");
    let start = body.find(&pat)? + pat.len();
    let rest = &body[start..];
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(&stripped[..end])
    } else {
        let end = rest.find([',', ')']).unwrap_or(rest.len());
        Some(rest[..end].trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
!1 = !DIFile(filename: "foo.cc", directory: "/src")
!8 = !DIBasicType(name: "int", size: 32, encoding: DW_ATE_signed)
!9 = !DILocalVariable(name: "x", scope: !4, file: !1, line: 12, type: !8)
  call void @llvm.dbg.declare(metadata i32* %x.addr, metadata !9, metadata !DIExpression()), !dbg !10
!20 = distinct !DICompositeType(tag: DW_TAG_class_type, name: "Foo", file: !1, line: 1, elements: !21)
!21 = !{!22}
!22 = !DIDerivedType(tag: DW_TAG_member, name: "retry_count", scope: !20, file: !1, line: 3, baseType: !8)
"#;

    #[test]
    fn resolves_declared_local_by_ssa_name() {
        let info = DebugInfo::scrape(SAMPLE);
        let v = info.variable_for_ssa("%x.addr").unwrap();
        assert_eq!(v.name, "x");
        assert_eq!(v.file, "foo.cc");
        assert_eq!(v.line, 12);
        assert_eq!(v.type_name, "int");
    }

    #[test]
    fn resolves_class_field_by_index() {
        let info = DebugInfo::scrape(SAMPLE);
        let field = info.class_field("Foo", 0).unwrap();
        assert_eq!(field.name, "retry_count");
    }

    #[test]
    fn unknown_ssa_name_resolves_to_none() {
        let info = DebugInfo::scrape(SAMPLE);
        assert!(info.variable_for_ssa("%nope").is_none());
    }
}
