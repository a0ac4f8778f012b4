//! Index-based editing of method bodies.
//!
//! Every operation splices the instruction list and returns the cursor after the edit: the
//! index one past the last inserted instruction, or the index the removed range started at.
//! Chaining calls on the returned cursor keeps positions consistent.
//!
//! Branch targets, switch tables and exception clause boundaries refer to instruction ids.
//! When an edit removes an instruction that something still refers to, the reference moves
//! to the first replacement instruction, or to the instruction now following the removed
//! range. Exception clauses ending at a removed last instruction end at the end of the method
//! instead, and clauses whose start has nowhere to go are dropped.
//!
//! Indices outside `0..=len`, a range with `start > end`, and removing the target of a branch
//! with nothing left to redirect it to are programming errors and panic.

use std::collections::HashSet;

use crate::{
    assembly::{Instruction, InstructionId, Operand},
    metadata::method::MethodBody,
};

impl MethodBody {
    /// Inserts `instructions` before index `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at > len`.
    pub fn insert(&mut self, at: usize, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        self.replace_range(at, at, instructions)
    }

    /// Inserts `instructions` at the start of the body.
    pub fn prepend(&mut self, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        self.replace_range(0, 0, instructions)
    }

    /// Appends `instructions` to the end of the body.
    pub fn append(&mut self, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        let len = self.len();
        self.replace_range(len, len, instructions)
    }

    /// Replaces the instruction at `at` with `instructions`.
    ///
    /// # Panics
    ///
    /// Panics if `at >= len`.
    pub fn replace(&mut self, at: usize, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        self.replace_range(at, at + 1, instructions)
    }

    /// Replaces `0..end` with `instructions`.
    ///
    /// # Panics
    ///
    /// Panics if `end > len`.
    pub fn replace_start(&mut self, end: usize, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        self.replace_range(0, end, instructions)
    }

    /// Replaces `start..len` with `instructions`.
    ///
    /// # Panics
    ///
    /// Panics if `start > len`.
    pub fn replace_end(&mut self, start: usize, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        let len = self.len();
        self.replace_range(start, len, instructions)
    }

    /// Replaces the whole body with `instructions`.
    pub fn replace_all(&mut self, instructions: impl IntoIterator<Item = Instruction>) -> usize {
        let len = self.len();
        self.replace_range(0, len, instructions)
    }

    /// Removes the instruction at `at`.
    ///
    /// # Panics
    ///
    /// Panics if `at >= len`, or if a branch targets it and it was the last instruction.
    pub fn remove(&mut self, at: usize) -> usize {
        self.replace_range(at, at + 1, [])
    }

    /// Removes `start..end`.
    ///
    /// # Panics
    ///
    /// Panics on an invalid range, or if a surviving branch targets the removed range and no
    /// instruction follows it.
    pub fn remove_range(&mut self, start: usize, end: usize) -> usize {
        self.replace_range(start, end, [])
    }

    /// Removes `0..end`.
    pub fn remove_start(&mut self, end: usize) -> usize {
        self.replace_range(0, end, [])
    }

    /// Removes `start..len`.
    pub fn remove_end(&mut self, start: usize) -> usize {
        let len = self.len();
        self.replace_range(start, len, [])
    }

    /// Removes every instruction and exception clause.
    pub fn clear(&mut self) {
        self.instructions.clear();
        self.exception_handlers.clear();
    }

    /// Replaces `start..end` with `instructions`.
    ///
    /// Detached instructions, and instructions whose id is already taken by a surviving
    /// instruction, receive a fresh id. Instructions created through [`MethodBody::create`]
    /// keep theirs, so branches built against them before insertion stay valid.
    ///
    /// # Panics
    ///
    /// Panics if `start > end`, `end > len`, or if a surviving branch targets the removed range
    /// and there is neither a replacement nor a following instruction.
    pub fn replace_range(
        &mut self,
        start: usize,
        end: usize,
        instructions: impl IntoIterator<Item = Instruction>,
    ) -> usize {
        assert!(
            start <= end && end <= self.len(),
            "edit range {start}..{end} outside of body with {} instructions",
            self.len()
        );

        let mut taken: HashSet<InstructionId> = self.instructions[..start]
            .iter()
            .chain(&self.instructions[end..])
            .map(Instruction::id)
            .collect();

        let mut inserted: Vec<Instruction> = instructions.into_iter().collect();
        for instruction in &mut inserted {
            let id = instruction.id();
            if !self.owns(id) || taken.contains(&id) {
                instruction.set_id(self.allocate_id());
            }
            taken.insert(instruction.id());
        }

        let removed: HashSet<InstructionId> = self.instructions[start..end]
            .iter()
            .map(Instruction::id)
            .filter(|id| !taken.contains(id))
            .collect();

        let redirect = inserted
            .first()
            .or_else(|| self.instructions.get(end))
            .map(Instruction::id);

        let count = inserted.len();
        self.instructions.splice(start..end, inserted);

        if !removed.is_empty() {
            log::debug!(
                "removed {} instructions at {start}, redirecting references to {}",
                removed.len(),
                redirect.map_or_else(|| "end of method".to_string(), |id| id.to_string())
            );
            self.redirect_branches(&removed, redirect);
            self.redirect_handlers(&removed, redirect);
        }

        start + count
    }

    fn redirect_branches(&mut self, removed: &HashSet<InstructionId>, redirect: Option<InstructionId>) {
        let retarget = |target: &mut InstructionId| {
            if removed.contains(target) {
                match redirect {
                    Some(id) => *target = id,
                    None => panic!("branch target {target} removed with no instruction left to redirect to"),
                }
            }
        };

        for instruction in &mut self.instructions {
            match &mut instruction.operand {
                Operand::Target(target) => retarget(target),
                Operand::Switch(targets) => targets.iter_mut().for_each(|target| retarget(target)),
                _ => {}
            }
        }
    }

    fn redirect_handlers(&mut self, removed: &HashSet<InstructionId>, redirect: Option<InstructionId>) {
        let start = |id: InstructionId| if removed.contains(&id) { redirect } else { Some(id) };
        let end = |id: Option<InstructionId>| id.and_then(start);

        self.exception_handlers.retain_mut(|handler| {
            let (Some(try_start), Some(handler_start)) = (start(handler.try_start), start(handler.handler_start))
            else {
                log::warn!("dropping exception clause whose protected or handler block was removed");
                return false;
            };
            let filter_start = match handler.filter_start {
                Some(filter) => match start(filter) {
                    Some(id) => Some(id),
                    None => {
                        log::warn!("dropping exception clause whose filter block was removed");
                        return false;
                    }
                },
                None => None,
            };

            handler.try_start = try_start;
            handler.handler_start = handler_start;
            handler.filter_start = filter_start;
            handler.try_end = end(handler.try_end);
            handler.handler_end = end(handler.handler_end);
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembly::{Instruction, OpCode, Operand},
        metadata::{
            method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody},
            references::{FieldRef, MethodRef, ResolutionScope, TypeRef},
            signatures::{MethodSig, TypeSig},
        },
    };

    fn item() -> TypeRef {
        TypeRef::new(ResolutionScope::Module, "Terraria", "Item")
    }

    fn field() -> FieldRef {
        FieldRef::new(item(), "stack", TypeSig::Int32)
    }

    fn method() -> MethodRef {
        MethodRef::new(item(), "Clamp", MethodSig::new_static(TypeSig::Int32, vec![TypeSig::Int32]))
    }

    fn sample() -> MethodBody {
        let mut body = MethodBody::new();
        body.append(vec![
            Instruction::load_argument(0),
            Instruction::new(OpCode::Ldfld, Operand::Field(field())),
            Instruction::call(method()),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::Ret),
        ]);
        body
    }

    fn opcodes(body: &MethodBody) -> Vec<OpCode> {
        body.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_replace_range_tail() {
        let mut body = sample();
        let cursor = body.replace_range(3, 5, [Instruction::simple(OpCode::Ret)]);
        assert_eq!(cursor, 4);
        assert_eq!(opcodes(&body), [OpCode::Ldarg0, OpCode::Ldfld, OpCode::Call, OpCode::Ret]);
        assert_eq!(body.instructions[1].operand, Operand::Field(field()));
    }

    #[test]
    fn test_cursors() {
        let mut body = sample();
        assert_eq!(body.insert(2, [Instruction::simple(OpCode::Nop), Instruction::simple(OpCode::Nop)]), 4);
        assert_eq!(body.len(), 7);
        assert_eq!(body.prepend([Instruction::simple(OpCode::Nop)]), 1);
        assert_eq!(body.remove_range(0, 1), 0);
        assert_eq!(body.remove(2), 2);
        assert_eq!(body.replace(2, [Instruction::simple(OpCode::Dup)]), 3);
        assert_eq!(
            opcodes(&body),
            [OpCode::Ldarg0, OpCode::Ldfld, OpCode::Dup, OpCode::Call, OpCode::Pop, OpCode::Ret]
        );
        assert_eq!(body.remove_start(2), 0);
        assert_eq!(body.remove_end(3), 3);
        assert_eq!(opcodes(&body), [OpCode::Dup, OpCode::Call, OpCode::Pop]);
        assert_eq!(body.replace_end(1, [Instruction::simple(OpCode::Ret)]), 2);
        assert_eq!(body.replace_start(1, []), 0);
        assert_eq!(opcodes(&body), [OpCode::Ret]);
        body.clear();
        assert!(body.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut body = sample();
        let duplicate = body.instructions[4].clone();
        body.append([duplicate, Instruction::simple(OpCode::Nop)]);

        let mut ids: Vec<_> = body.instructions.iter().map(Instruction::id).collect();
        assert!(ids.iter().all(|id| !id.is_detached()));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), body.len());
    }

    #[test]
    fn test_created_instructions_keep_ids() {
        let mut body = MethodBody::new();
        let ret = body.create(OpCode::Ret, Operand::None);
        let branch = Instruction::new(OpCode::BrS, Operand::Target(ret.id()));
        body.append([branch, Instruction::simple(OpCode::Nop), ret]);
        assert_eq!(body.instructions[0].operand, Operand::Target(body.instructions[2].id()));
    }

    #[test]
    fn test_branches_follow_replacement() {
        let mut body = MethodBody::new();
        let target = body.create(OpCode::Nop, Operand::None);
        let target_id = target.id();
        let branch = Instruction::new(OpCode::BrS, Operand::Target(target_id));
        body.append([branch, target, Instruction::simple(OpCode::Ret)]);

        body.replace(1, [Instruction::simple(OpCode::Dup), Instruction::simple(OpCode::Pop)]);
        assert_eq!(body.instructions[0].operand, Operand::Target(body.instructions[1].id()));

        body.remove_range(1, 3);
        assert_eq!(body.instructions[0].operand, Operand::Target(body.instructions[1].id()));
        assert_eq!(body.instructions[1].opcode, OpCode::Ret);
    }

    #[test]
    fn test_switch_tables_are_redirected() {
        let mut body = MethodBody::new();
        let first = body.create(OpCode::Nop, Operand::None);
        let second = body.create(OpCode::Ret, Operand::None);
        let switch = Instruction::new(OpCode::Switch, Operand::Switch(vec![first.id(), second.id()]));
        body.append([switch, first, second]);

        body.remove(1);
        let ret = body.instructions[1].id();
        assert_eq!(body.instructions[0].operand, Operand::Switch(vec![ret, ret]));
    }

    #[test]
    #[should_panic(expected = "no instruction left")]
    fn test_dangling_branch_panics() {
        let mut body = MethodBody::new();
        let ret = body.create(OpCode::Ret, Operand::None);
        let branch = Instruction::new(OpCode::BrS, Operand::Target(ret.id()));
        body.append([branch, ret]);
        body.remove(1);
    }

    #[test]
    #[should_panic(expected = "outside of body")]
    fn test_out_of_range_panics() {
        let mut body = sample();
        body.insert(6, []);
    }

    #[test]
    #[should_panic(expected = "outside of body")]
    fn test_inverted_range_panics() {
        let mut body = sample();
        body.remove_range(3, 2);
    }

    #[test]
    fn test_handlers_are_redirected() {
        let mut body = MethodBody::new();
        body.append(vec![
            Instruction::simple(OpCode::Nop),
            Instruction::simple(OpCode::LeaveS),
            Instruction::simple(OpCode::Pop),
            Instruction::simple(OpCode::LeaveS),
            Instruction::simple(OpCode::Ret),
        ]);
        let ids: Vec<_> = body.instructions.iter().map(Instruction::id).collect();
        body.exception_handlers.push(ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start: ids[0],
            try_end: Some(ids[2]),
            handler_start: ids[2],
            handler_end: Some(ids[4]),
            catch_type: None,
            filter_start: None,
        });

        body.replace(0, [Instruction::simple(OpCode::Dup), Instruction::simple(OpCode::Pop)]);
        let handler = &body.exception_handlers[0];
        assert_eq!(handler.try_start, body.instructions[0].id());
        assert_eq!(handler.handler_start, ids[2]);

        body.remove_end(4);
        let handler = &body.exception_handlers[0];
        assert_eq!(handler.handler_end, None);

        body.remove_range(3, 4);
        assert!(body.exception_handlers.is_empty());
    }
}
