//! Shared scaffolding for the end-to-end suites.
//!
//! Stands in for the external toolchain: a miniature decorator that
//! instruments pristine modules per the decoration contract, plus the
//! wiring that compiles the decorated module, embeds the pristine
//! bitcode, and fills the reflect address table — exactly what the
//! real decorator does at ahead-of-time compile time.

use drti_ir::bitcode;
use drti_ir::builder::{FunctionBuilder, ModuleBuilder};
use drti_ir::globals::{listed_entry_count, listed_function_declarations, visit_listed_globals};
use drti_ir::module::{BinOpKind, Inst, Linkage, Module, ValueId};
use drti_ir::types::{Signature, Ty};
use drti_jit::codegen::{compile_module, CompiledModule, TableResolver};
use drti_jit::SymbolResolver;
use drti_runtime::intrinsics;
use drti_runtime::tree::{
    LandingSite, Reflect, StaticCallsite, TREENODE_RESOLVED_TARGET_OFFSET,
};
use smallvec::SmallVec;

// =============================================================================
// Support symbols
// =============================================================================

/// The resolver decorated code is linked against: runtime intrinsics
/// plus whatever application externs the unit needs.
pub fn support_symbols(extra: &[(&str, usize)]) -> TableResolver {
    let mut table = TableResolver::new();
    table.insert("_drti_call_from", intrinsics::_drti_call_from as usize);
    table.insert("_drti_landed", intrinsics::_drti_landed as usize);
    table.insert(
        "_drti_validate_caller",
        intrinsics::_drti_validate_caller as usize,
    );
    for (name, addr) in extra {
        table.insert(name, *addr);
    }
    table
}

// =============================================================================
// The miniature decorator
// =============================================================================

fn drti_declarations(module: &mut Module) {
    let ptr = Ty::raw_ptr();
    let decls: [(&str, Signature); 5] = [
        ("_drti_caller", Signature::new(vec![], ptr.clone())),
        (
            "_drti_set_caller",
            Signature::new(vec![ptr.clone()], Ty::Void),
        ),
        (
            "_drti_validate_caller",
            Signature::new(vec![ptr.clone(), ptr.clone()], ptr.clone()),
        ),
        (
            "_drti_call_from",
            Signature::new(vec![ptr.clone(), ptr.clone(), ptr.clone()], ptr.clone()),
        ),
        (
            "_drti_landed",
            Signature::new(vec![ptr.clone(), ptr.clone()], Ty::Void),
        ),
    ];
    for (name, sig) in decls {
        if module.function(name).is_none() {
            module
                .functions
                .push(drti_ir::Function::declaration(name, sig));
        }
    }
}

/// Decorate one function of a pristine module:
/// - the prologue validates the carrier value against the stash and
///   reports the landing;
/// - every indirect call dispatches through its treenode's active
///   target and threads the node as the next caller context.
pub fn decorate_module(
    pristine: &Module,
    fn_name: &str,
    landing_addr: usize,
    site_addrs: &[usize],
) -> Module {
    let mut module = pristine.clone();
    module.name = format!("{}.decorated", module.name);
    drti_declarations(&mut module);

    let ptr = Ty::raw_ptr();
    let func = module.function_mut(fn_name).expect("decorated function");

    // Entry instrumentation.
    let raw = func.alloc_value();
    let ra = func.alloc_value();
    let ctx = func.alloc_value();
    let landing_const = func.alloc_value();
    let prologue = vec![
        (
            raw,
            Inst::Call {
                callee: "_drti_caller".to_string(),
                sig: Signature::new(vec![], ptr.clone()),
                args: SmallVec::new(),
            },
        ),
        (ra, Inst::RetAddr),
        (
            ctx,
            Inst::Call {
                callee: "_drti_validate_caller".to_string(),
                sig: Signature::new(vec![ptr.clone(), ptr.clone()], ptr.clone()),
                args: SmallVec::from_slice(&[raw, ra]),
            },
        ),
        (
            landing_const,
            Inst::ConstPtr {
                ty: ptr.clone(),
                value: landing_addr as u64,
            },
        ),
        (
            ValueId::INVALID,
            Inst::Call {
                callee: "_drti_landed".to_string(),
                sig: Signature::new(vec![ptr.clone(), ptr.clone()], Ty::Void),
                args: SmallVec::from_slice(&[landing_const, ctx]),
            },
        ),
    ];
    let mut entry = std::mem::take(&mut func.blocks[0].insts);
    let mut with_prologue = prologue;
    with_prologue.append(&mut entry);
    func.blocks[0].insts = with_prologue;

    // Callsite instrumentation.
    let mut next_site = 0usize;
    for bidx in 0..func.blocks.len() {
        let old = std::mem::take(&mut func.blocks[bidx].insts);
        let mut new_insts = Vec::with_capacity(old.len());
        for (id, inst) in old {
            match inst {
                Inst::CallIndirect { callee, sig, args } => {
                    let site_addr = site_addrs[next_site];
                    next_site += 1;

                    let site_const = func.alloc_value();
                    new_insts.push((
                        site_const,
                        Inst::ConstPtr {
                            ty: ptr.clone(),
                            value: site_addr as u64,
                        },
                    ));
                    let node = func.alloc_value();
                    new_insts.push((
                        node,
                        Inst::Call {
                            callee: "_drti_call_from".to_string(),
                            sig: Signature::new(
                                vec![ptr.clone(), ptr.clone(), ptr.clone()],
                                ptr.clone(),
                            ),
                            args: SmallVec::from_slice(&[site_const, ctx, callee]),
                        },
                    ));
                    // Load the node's active target.
                    let node_bits = func.alloc_value();
                    new_insts.push((
                        node_bits,
                        Inst::Cast {
                            ty: Ty::I64,
                            value: node,
                        },
                    ));
                    let offset = func.alloc_value();
                    new_insts.push((
                        offset,
                        Inst::ConstInt {
                            ty: Ty::I64,
                            value: TREENODE_RESOLVED_TARGET_OFFSET as i64,
                        },
                    ));
                    let cell_bits = func.alloc_value();
                    new_insts.push((
                        cell_bits,
                        Inst::BinOp {
                            op: BinOpKind::Add,
                            ty: Ty::I64,
                            lhs: node_bits,
                            rhs: offset,
                        },
                    ));
                    let cell = func.alloc_value();
                    new_insts.push((
                        cell,
                        Inst::Cast {
                            ty: ptr.clone(),
                            value: cell_bits,
                        },
                    ));
                    let active = func.alloc_value();
                    new_insts.push((
                        active,
                        Inst::Load {
                            ty: ptr.clone(),
                            ptr: cell,
                        },
                    ));
                    new_insts.push((
                        ValueId::INVALID,
                        Inst::Call {
                            callee: "_drti_set_caller".to_string(),
                            sig: Signature::new(vec![ptr.clone()], Ty::Void),
                            args: SmallVec::from_slice(&[node]),
                        },
                    ));
                    new_insts.push((
                        id,
                        Inst::CallIndirect {
                            callee: active,
                            sig,
                            args,
                        },
                    ));
                }
                other => new_insts.push((id, other)),
            }
        }
        func.blocks[bidx].insts = new_insts;
    }
    assert_eq!(next_site, site_addrs.len(), "callsite count mismatch");

    module
}

/// Call-number ordinals (over all call instructions) of the indirect
/// calls in a pristine function, in iteration order.
pub fn indirect_call_ordinals(module: &Module, fn_name: &str) -> Vec<u32> {
    let func = module.function(fn_name).expect("function");
    let mut ordinals = Vec::new();
    let mut ordinal = 0u32;
    for block in &func.blocks {
        for (_, inst) in &block.insts {
            match inst {
                Inst::Call { .. } => ordinal += 1,
                Inst::CallIndirect { .. } => {
                    ordinals.push(ordinal);
                    ordinal += 1;
                }
                _ => {}
            }
        }
    }
    ordinals
}

// =============================================================================
// Units
// =============================================================================

/// One "decorated translation unit": the compiled decorated code, its
/// landing site, its callsites, and the filled reflect record.
pub struct TestUnit {
    pub compiled: &'static CompiledModule,
    pub landing: &'static LandingSite,
    pub sites: Vec<&'static StaticCallsite>,
}

impl TestUnit {
    pub fn function(&self, name: &str) -> usize {
        self.compiled.function_address(name).expect("aot function")
    }

    pub fn global(&self, name: &str) -> usize {
        self.compiled.global_address(name).expect("aot global")
    }
}

/// Build, decorate, compile and register one translation unit the way
/// the decorator would at build time.
pub fn build_decorated_unit(
    pristine: Module,
    fn_name: &'static str,
    extern_addrs: &[(&str, usize)],
) -> TestUnit {
    let bytes: &'static [u8] = Box::leak(bitcode::write_module(&pristine).into_boxed_slice());
    let table_len = listed_entry_count(&pristine);
    let table: &'static mut [usize] = Box::leak(vec![0usize; table_len].into_boxed_slice());

    let reflect: &'static Reflect = Box::leak(Box::new(Reflect {
        module: bytes.as_ptr(),
        module_size: bytes.len(),
        globals: table.as_ptr(),
        globals_size: table_len,
    }));
    let global_name: &'static str =
        Box::leak(format!("__drti_local_{}", fn_name).into_boxed_str());
    let landing: &'static LandingSite =
        Box::leak(Box::new(LandingSite::new(global_name, fn_name, reflect)));

    let ordinals = indirect_call_ordinals(&pristine, fn_name);
    let sites: Vec<&'static StaticCallsite> = ordinals
        .iter()
        .map(|n| &*Box::leak(Box::new(StaticCallsite::new(landing, *n))))
        .collect();
    let site_addrs: Vec<usize> = sites
        .iter()
        .map(|s| *s as *const StaticCallsite as usize)
        .collect();

    let decorated = decorate_module(
        &pristine,
        fn_name,
        landing as *const LandingSite as usize,
        &site_addrs,
    );
    let support = support_symbols(extern_addrs);
    let resolvers: [&dyn SymbolResolver; 1] = [&support];
    let compiled = compile_module(&decorated, &resolvers)
        .expect("ahead-of-time compile")
        .leak();

    // Fill the address table in the decorator's enumeration order:
    // listed globals first (declared ones resolve like externs, the
    // way the build-time linker would), then non-intrinsic function
    // declarations.
    let lookup_extern = |name: &str| {
        extern_addrs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, addr)| *addr)
    };
    let mut index = 0usize;
    for global in visit_listed_globals(&pristine) {
        table[index] = if global.is_declaration() {
            lookup_extern(&global.name).expect("extern global address")
        } else {
            compiled
                .global_address(&global.name)
                .expect("decorated global")
        };
        index += 1;
    }
    for decl in listed_function_declarations(&pristine) {
        table[index] = lookup_extern(&decl.name).expect("extern declaration address");
        index += 1;
    }
    assert_eq!(index, table_len);

    TestUnit {
        compiled,
        landing,
        sites,
    }
}

/// Compile a module without decoration (undecorated helper code).
pub fn build_plain_unit(module: Module, extern_addrs: &[(&str, usize)]) -> &'static CompiledModule {
    let support = support_symbols(extern_addrs);
    let resolvers: [&dyn SymbolResolver; 1] = [&support];
    compile_module(&module, &resolvers)
        .expect("ahead-of-time compile")
        .leak()
}

// =============================================================================
// Pristine module builders
// =============================================================================

/// A target that bumps an internal counter and reports the address of
/// its own code, revealing recompilation at runtime.
pub fn target_module(fn_name: &str, counter: &str) -> Module {
    let mut fb = FunctionBuilder::new(fn_name, Signature::new(vec![], Ty::raw_ptr()));
    let addr = fb.global_addr(counter);
    let old = fb.load(Ty::I64, addr);
    let one = fb.const_int(Ty::I64, 1);
    let new = fb.binop(BinOpKind::Add, Ty::I64, old, one);
    fb.store(addr, new);
    let here = fb.code_addr();
    fb.ret(Some(here));

    let mut mb = ModuleBuilder::new(fn_name);
    mb.define_global(counter, Ty::I64, Linkage::Internal, 0)
        .add_function(fb.finish());
    mb.build()
}

/// A wrapper that invokes a zero-argument target through a function
/// pointer.
pub fn invoke_module(fn_name: &str) -> Module {
    let mut fb = FunctionBuilder::new(
        fn_name,
        Signature::new(vec![Ty::raw_ptr()], Ty::raw_ptr()),
    );
    let target = fb.param(0);
    let result = fb.call_indirect(target, Signature::new(vec![], Ty::raw_ptr()), &[]);
    fb.ret(Some(result));

    let mut mb = ModuleBuilder::new(fn_name);
    mb.add_function(fb.finish());
    mb.build()
}

/// A root caller: `name(f, a1..an) { return f(a1..an) }`, all
/// pointer-shaped. The chain needs at least two decorated frames for
/// anything to specialize.
pub fn chain_module(fn_name: &str, extra_args: usize) -> Module {
    let ptr = Ty::raw_ptr();
    let mut params = vec![ptr.clone()];
    params.extend(std::iter::repeat(ptr.clone()).take(extra_args));
    let mut fb = FunctionBuilder::new(fn_name, Signature::new(params, ptr.clone()));
    let f = fb.param(0);
    let args: Vec<ValueId> = (0..extra_args).map(|i| fb.param(i + 1)).collect();
    let inner_sig = Signature::new(vec![ptr.clone(); extra_args], ptr.clone());
    let result = fb.call_indirect(f, inner_sig, &args);
    fb.ret(Some(result));

    let mut mb = ModuleBuilder::new(fn_name);
    mb.add_function(fb.finish());
    mb.build()
}
